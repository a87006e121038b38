/// Print a trace line for an allocator slow path.
///
/// Formats without allocating, so it is safe with any allocator lock held.
/// Compiles to nothing (including the arguments) when the `debug` feature is
/// disabled.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug")]
        {
            $crate::stderr::print_line(format_args!($($arg)*));
        }
    };
}
