use std::ffi::CStr;

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char).
// It's limited to 16 bytes, including the null terminator.
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is guaranteed to be null-terminated because it was
    // zero-initialized and we only write the first `len_to_copy` bytes.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for i in 0..len_to_copy {
        c_name_buf[i] = bytes[i] as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

/// Gets the name of the current thread as the kernel knows it.
pub(crate) fn current_thread_name() -> String {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };
    if ret != 0 {
        return "unknown".into();
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str.to_string_lossy().into_owned()
}

/// The kernel LWP id of the current thread.
pub(crate) fn current_thread_lwpid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_name() {
        std::thread::spawn(|| {
            set_current_thread_name("posd/test");
            assert_eq!(current_thread_name(), "posd/test");
            assert!(current_thread_lwpid() > 0);
        })
        .join()
        .unwrap();
    }
}
