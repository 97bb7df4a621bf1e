//! Minimal tagged console logging over the PL011 UART.
//!
//! There is no allocator and no `core::fmt`-heavy formatter here by
//! design — `uart_puts`/`uart_put_hex`/`uart_put_u64` are the whole
//! budget, same as the rest of the crate's boot-time diagnostics.

/// Write a tagged line: `[INFO] <msg>`.
pub fn info(msg: &[u8]) {
    crate::uart_puts(b"[INFO] ");
    crate::uart_puts(msg);
    crate::uart_puts(b"\n");
}

pub fn warn(msg: &[u8]) {
    crate::uart_puts(b"[WARN] ");
    crate::uart_puts(msg);
    crate::uart_puts(b"\n");
}

pub fn err(msg: &[u8]) {
    crate::uart_puts(b"[ERR ] ");
    crate::uart_puts(msg);
    crate::uart_puts(b"\n");
}

#[macro_export]
macro_rules! log_info {
    ($msg:expr) => {
        $crate::klog::info($msg)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($msg:expr) => {
        $crate::klog::warn($msg)
    };
}

#[macro_export]
macro_rules! log_err {
    ($msg:expr) => {
        $crate::klog::err($msg)
    };
}
