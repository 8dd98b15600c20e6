//! File name expressions as the kernel evaluates them for directory queries.
//!
//! Besides `*` and `?` the kernel understands the DOS wildcards produced by
//! the Win32 layer: `<` (DOS star), `>` (DOS question mark) and `"` (DOS dot).

use crate::path::fold_case;

const DOS_STAR: char = '<';
const DOS_QM: char = '>';
const DOS_DOT: char = '"';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    expr: Vec<char>,
}

impl Default for NamePattern {
    fn default() -> Self {
        NamePattern::match_all()
    }
}

impl NamePattern {
    pub fn match_all() -> NamePattern {
        NamePattern { expr: vec!['*'] }
    }

    /// An NT expression, as passed to `NtQueryDirectoryFile`. An empty
    /// expression matches everything.
    pub fn parse(expr: &str) -> NamePattern {
        if expr.is_empty() {
            return NamePattern::match_all();
        }
        NamePattern {
            expr: fold_case(expr).chars().collect(),
        }
    }

    /// A Win32 pattern, as passed to `FindFirstFile`, translated the way the
    /// Win32 layer rewrites it before querying the kernel.
    pub fn from_win32(pattern: &str) -> NamePattern {
        if pattern.is_empty() || pattern == "*.*" {
            return NamePattern::match_all();
        }
        let chars: Vec<char> = pattern.chars().collect();
        let mut expr = String::with_capacity(pattern.len());
        for (i, &c) in chars.iter().enumerate() {
            let next = chars.get(i + 1).copied();
            match c {
                '?' => expr.push(DOS_QM),
                '.' if matches!(next, None | Some('?') | Some('*')) => expr.push(DOS_DOT),
                '*' if next == Some('.') => expr.push(DOS_STAR),
                c => expr.push(c),
            }
        }
        NamePattern::parse(&expr)
    }

    pub fn is_match_all(&self) -> bool {
        self.expr == ['*']
    }

    pub fn has_wildcards(&self) -> bool {
        self.expr
            .iter()
            .any(|c| matches!(*c, '*' | '?' | DOS_STAR | DOS_QM | DOS_DOT))
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.is_match_all() {
            return true;
        }
        let name: Vec<char> = fold_case(name).chars().collect();
        let last_dot = name.iter().rposition(|&c| c == '.');
        let mut memo = vec![None; (self.expr.len() + 1) * (name.len() + 1)];
        Matcher {
            expr: &self.expr,
            name: &name,
            last_dot,
            memo: &mut memo,
        }
        .at(0, 0)
    }
}

struct Matcher<'a> {
    expr: &'a [char],
    name: &'a [char],
    last_dot: Option<usize>,
    memo: &'a mut [Option<bool>],
}

impl Matcher<'_> {
    fn at(&mut self, e: usize, n: usize) -> bool {
        let slot = e * (self.name.len() + 1) + n;
        if let Some(result) = self.memo[slot] {
            return result;
        }
        let result = self.compute(e, n);
        self.memo[slot] = Some(result);
        result
    }

    fn compute(&mut self, e: usize, n: usize) -> bool {
        let at_end = n == self.name.len();
        let c = match self.expr.get(e) {
            Some(&c) => c,
            None => return at_end,
        };
        let current = self.name.get(n).copied();
        match c {
            '*' => self.at(e + 1, n) || (!at_end && self.at(e, n + 1)),
            '?' => !at_end && self.at(e + 1, n + 1),
            DOS_STAR => {
                self.at(e + 1, n) || (!at_end && Some(n) != self.last_dot && self.at(e, n + 1))
            }
            DOS_QM => match current {
                Some(ch) if ch != '.' => self.at(e + 1, n + 1),
                _ => self.at(e + 1, n),
            },
            DOS_DOT => match current {
                Some('.') => self.at(e + 1, n + 1),
                None => self.at(e + 1, n),
                _ => false,
            },
            literal => current == Some(literal) && self.at(e + 1, n + 1),
        }
    }
}
