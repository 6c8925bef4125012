use std::panic::{catch_unwind, AssertUnwindSafe};

/// Runs a user callback on a driver thread.
///
/// A panic from user code must never take a driver thread down; it is
/// logged and the worker loop continues. Returns whether the callback
/// completed normally.
pub(crate) fn run_callback<F: FnOnce()>(what: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            log::error!("Unhandled panic from {}: {}", what, describe_panic(&payload));
            false
        }
    }
}

pub(crate) fn describe_panic(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "(non-string panic payload)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_is_contained() {
        assert!(run_callback("test callback", || ()));
        assert!(!run_callback("test callback", || panic!("boom")));
    }
}
