//! String assembler for the source rendition of synthesized method bodies.

use std::fmt::{self, Write};

use crate::error::IllegalStateError;

#[derive(Debug, Default)]
pub struct CodeBuilder {
    buf: String,
    depth: usize,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a scope.
    pub fn begin(&mut self) -> &mut Self {
        self.buf.push('{');
        self.depth += 1;
        self
    }

    /// Closes the innermost scope.
    pub fn end(&mut self) -> Result<&mut Self, IllegalStateError> {
        if self.depth == 0 {
            return Err(IllegalStateError::new("end() without matching begin()"));
        }
        self.buf.push('}');
        self.depth -= 1;
        Ok(self)
    }

    pub fn append(&mut self, s: &str) -> &mut Self {
        self.buf.push_str(s);
        self
    }

    pub fn format(&mut self, args: fmt::Arguments<'_>) -> &mut Self {
        // Writing into a String cannot fail.
        let _ = self.buf.write_fmt(args);
        self
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn build(self) -> Result<String, IllegalStateError> {
        if self.depth != 0 {
            return Err(IllegalStateError::new(format!("{} unclosed scope(s)", self.depth)));
        }
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_must_balance() {
        let mut b = CodeBuilder::new();
        b.begin().append("a();");
        assert!(CodeBuilder::new().end().is_err());
        assert_eq!(b.depth(), 1);
        assert!(CodeBuilder { buf: String::new(), depth: 1 }.build().is_err());
        b.end().unwrap();
        assert_eq!(b.build().unwrap(), "{a();}");
    }

    #[test]
    fn format_appends() {
        let mut b = CodeBuilder::new();
        b.begin().format(format_args!("x = {};", 3));
        b.end().unwrap();
        assert_eq!(b.build().unwrap(), "{x = 3;}");
    }
}
