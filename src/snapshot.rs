//! The flat, versioned form of a session's configuration.
//!
//! Hooked processes never share the coordinator's tree; they rebuild their
//! own copy from these bytes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, VfsError},
    parameters::Parameters,
    path::VirtualPathKey,
    tree::{LinkFlags, LinkTarget, Precedence, RedirectionTree},
};

pub const SNAPSHOT_MAGIC: u32 = 0x5346_5655; // "UVFS"
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatLink {
    /// Virtual location, root segment first.
    pub segments: Vec<String>,
    pub real: String,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfigSnapshot {
    pub parameters: Parameters,
    pub precedence: Precedence,
    /// Parents before children; per node in priority order.
    pub links: Vec<FlatLink>,
    pub skip_file_suffixes: Vec<String>,
    pub skip_directories: Vec<String>,
    pub executable_blacklist: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: u32,
    version: u32,
    snapshot: SharedConfigSnapshot,
}

impl SharedConfigSnapshot {
    pub fn capture(
        parameters: &Parameters,
        tree: &RedirectionTree,
        executable_blacklist: &[String],
    ) -> SharedConfigSnapshot {
        let links = tree
            .linked_nodes()
            .into_iter()
            .flat_map(|(segments, targets)| {
                targets.iter().map(move |target| FlatLink {
                    segments: segments.clone(),
                    real: target.real.to_string_lossy().into_owned(),
                    flags: target.flags.bits(),
                })
            })
            .collect();
        SharedConfigSnapshot {
            parameters: parameters.clone(),
            precedence: tree.precedence(),
            links,
            skip_file_suffixes: tree.skip_rules().file_suffixes().to_vec(),
            skip_directories: tree.skip_rules().directories().to_vec(),
            executable_blacklist: executable_blacklist.to_vec(),
        }
    }

    /// Rebuilds the tree exactly as captured, priorities included.
    pub fn restore_tree(&self) -> Result<RedirectionTree> {
        let mut tree = RedirectionTree::with_precedence(self.precedence);
        for suffix in &self.skip_file_suffixes {
            tree.skip_rules_mut().add_file_suffix(suffix);
        }
        for dir in &self.skip_directories {
            tree.skip_rules_mut().add_directory(dir);
        }
        for link in &self.links {
            if link.segments.is_empty() {
                return Err(corrupt(&self.parameters, "link without a location"));
            }
            let flags = LinkFlags::from_bits(link.flags)
                .ok_or_else(|| corrupt(&self.parameters, "unknown link flags"))?;
            tree.push_target(
                &VirtualPathKey::from_segments(link.segments.clone()),
                LinkTarget {
                    real: PathBuf::from(&link.real),
                    flags,
                },
            );
        }
        Ok(tree)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            snapshot: self.clone(),
        };
        Ok(bincode::serialize(&envelope)?)
    }

    pub fn from_bytes(instance: &str, bytes: &[u8]) -> Result<SharedConfigSnapshot> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        if envelope.magic != SNAPSHOT_MAGIC {
            return Err(VfsError::ChannelCorrupt {
                instance: instance.to_owned(),
                reason: format!("bad magic {:#x}", envelope.magic),
            });
        }
        if envelope.version != SNAPSHOT_VERSION {
            return Err(VfsError::ChannelCorrupt {
                instance: instance.to_owned(),
                reason: format!("unsupported snapshot version {}", envelope.version),
            });
        }
        Ok(envelope.snapshot)
    }

    pub fn is_blacklisted(&self, executable: &str) -> bool {
        is_blacklisted(&self.executable_blacklist, executable)
    }
}

fn corrupt(parameters: &Parameters, reason: &str) -> VfsError {
    VfsError::ChannelCorrupt {
        instance: parameters.instance_name().to_owned(),
        reason: reason.to_owned(),
    }
}

/// Blacklist entries match a whole path or its trailing components,
/// ignoring case.
pub fn is_blacklisted(blacklist: &[String], executable: &str) -> bool {
    let executable = crate::path::fold_case(&executable.replace('/', "\\"));
    blacklist.iter().any(|entry| {
        let entry = crate::path::fold_case(&entry.replace('/', "\\"));
        executable == entry || executable.ends_with(&format!("\\{}", entry))
    })
}
