//! Output handling for the `p(...)` builtin.
//!
//! Implement [`PrintWriter`] to capture or redirect program output. The
//! default [`StdPrint`] writes to stdout; [`CollectStringPrint`] gathers
//! output for tests and embedders; [`NoPrint`] discards it.

use std::{
    borrow::Cow,
    io::{self, Write as _},
};

/// Sink for values printed by a running program.
///
/// `p(...)` emits exactly the stringified value, no separators and no
/// trailing newline.
pub trait PrintWriter {
    fn write_value(&mut self, output: Cow<'_, str>);
}

/// Default writer: straight to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_value(&mut self, output: Cow<'_, str>) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(output.as_bytes());
        let _ = stdout.flush();
    }
}

/// Writer that collects all output into a string.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected output so far.
    pub fn output(&self) -> &str {
        &self.0
    }

    /// Consumes the writer and returns the collected output.
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_value(&mut self, output: Cow<'_, str>) {
        self.0.push_str(&output);
    }
}

/// Writer that ignores all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_value(&mut self, _output: Cow<'_, str>) {}
}
