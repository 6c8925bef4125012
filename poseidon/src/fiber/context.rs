//! Thin wrappers over the machine-context primitive.
//!
//! `yield` is the only operation that needs to swap register state; the
//! whole scheduler composes above these three calls.

pub(crate) type RawContext = libc::ucontext_t;

pub(crate) fn zeroed_context() -> Box<RawContext> {
    // getcontext/makecontext fully initialize the parts they use.
    unsafe { Box::new(std::mem::zeroed()) }
}

/// Saves the current context into `save` and resumes `resume`.
///
/// # Safety
///
/// Both pointers must reference valid, distinct contexts, and `resume`
/// must have been filled by `getcontext` or [`prepare`].
pub(crate) unsafe fn swap(save: *mut RawContext, resume: *mut RawContext) {
    let rc = libc::swapcontext(save, resume);
    // swapcontext only fails for invalid arguments; there is no way to
    // continue scheduling with a torn context.
    assert_eq!(rc, 0, "swapcontext failed: {}", std::io::Error::last_os_error());
}

/// Prepares `ctx` to run `entry(arg)` on the given stack.
///
/// `makecontext` passes `int` arguments only, so the pointer-sized `arg`
/// travels as two halves.
///
/// # Safety
///
/// The stack region must stay mapped for as long as the context may run.
pub(crate) unsafe fn prepare(
    ctx: &mut RawContext,
    stack_lo: *mut u8,
    stack_size: usize,
    entry: extern "C" fn(u32, u32),
    arg: usize,
) {
    let rc = libc::getcontext(ctx);
    assert_eq!(rc, 0, "getcontext failed: {}", std::io::Error::last_os_error());

    ctx.uc_stack.ss_sp = stack_lo as *mut libc::c_void;
    ctx.uc_stack.ss_size = stack_size;
    ctx.uc_stack.ss_flags = 0;
    ctx.uc_link = std::ptr::null_mut();

    let entry: extern "C" fn() = std::mem::transmute(entry);
    libc::makecontext(
        ctx,
        entry,
        2,
        (arg >> 32) as libc::c_int,
        (arg & 0xFFFF_FFFF) as libc::c_int,
    );
}

pub(crate) fn join_arg(hi: u32, lo: u32) -> usize {
    ((hi as usize) << 32) | (lo as usize)
}
