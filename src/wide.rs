//! UTF-16 strings as they cross the C and Win32 boundaries.

/// Reads a NUL-terminated UTF-16 string. Null pointers read as `None`.
///
/// # Safety
///
/// `ptr` must be null or point to a readable, NUL-terminated buffer.
pub unsafe fn from_ptr(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    Some(String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len)))
}

/// Reads a counted UTF-16 string of `bytes` bytes.
///
/// # Safety
///
/// `ptr` must be null or point to at least `bytes` readable bytes.
pub unsafe fn from_counted(ptr: *const u16, bytes: usize) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(String::from_utf16_lossy(std::slice::from_raw_parts(
        ptr,
        bytes / 2,
    )))
}

/// Reads a NUL-terminated UTF-8 string.
///
/// # Safety
///
/// `ptr` must be null or point to a readable, NUL-terminated buffer.
pub unsafe fn from_c_str(ptr: *const std::os::raw::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(
        std::ffi::CStr::from_ptr(ptr)
            .to_string_lossy()
            .into_owned(),
    )
}

pub fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Copies `value` into `buffer` with a terminating NUL. Returns false,
/// leaving the buffer untouched, when it does not fit.
pub fn copy_to(value: &str, buffer: &mut [u16]) -> bool {
    let wide: Vec<u16> = value.encode_utf16().collect();
    if wide.len() >= buffer.len() {
        return false;
    }
    buffer[..wide.len()].copy_from_slice(&wide);
    buffer[wide.len()] = 0;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_terminated_and_counted() {
        let wide = to_wide("C:\\data\\ä.txt");
        assert_eq!(
            unsafe { from_ptr(wide.as_ptr()) }.as_deref(),
            Some("C:\\data\\ä.txt")
        );
        assert_eq!(
            unsafe { from_counted(wide.as_ptr(), 4) }.as_deref(),
            Some("C:")
        );
        assert_eq!(unsafe { from_ptr(std::ptr::null()) }, None);
    }

    #[test]
    fn copy_respects_capacity() {
        let mut buffer = [0xFFFFu16; 4];
        assert!(!copy_to("abcd", &mut buffer));
        assert_eq!(buffer[0], 0xFFFF);
        assert!(copy_to("abc", &mut buffer));
        assert_eq!(buffer, [b'a' as u16, b'b' as u16, b'c' as u16, 0]);
    }

    #[test]
    fn c_strings() {
        let raw = std::ffi::CString::new("usvfs").unwrap();
        assert_eq!(unsafe { from_c_str(raw.as_ptr()) }.as_deref(), Some("usvfs"));
    }
}
