use vt100::Parser as VtParser;

use crate::sanitize::sanitize_chunk;

// Tall fixed screen stands in for unbounded scrollback: commands that redraw
// in place stay within the top rows, everything else scrolls naturally.
pub const VIRTUAL_ROWS: u16 = 500;

pub struct TerminalBuffer {
    parser: VtParser,
    rows: u16,
    cols: u16,
}

impl TerminalBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            parser: VtParser::new(rows, cols, 0),
            rows,
            cols,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn set_size(&mut self, cols: u16, rows: u16) {
        self.cols = cols.max(1);
        self.rows = rows.max(1);
        self.parser.set_size(self.rows, self.cols);
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    // The text a human watching the terminal would see: vt100 applies the
    // cursor and erase machinery, then residual artifacts are stripped while
    // SGR styling survives.
    pub fn contents(&self) -> String {
        let mut lines = self
            .parser
            .screen()
            .rows_formatted(0, self.cols)
            .map(|row| sanitize_chunk(&String::from_utf8_lossy(&row)))
            .collect::<Vec<String>>();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

pub struct OutputManager {
    buffer: Option<TerminalBuffer>,
    last_render: Option<String>,
}

impl OutputManager {
    pub fn new(cols: u16) -> Self {
        Self::with_rows(cols, VIRTUAL_ROWS)
    }

    pub fn with_rows(cols: u16, rows: u16) -> Self {
        Self {
            buffer: Some(TerminalBuffer::new(cols, rows)),
            last_render: None,
        }
    }

    // None means the rendered text did not change; callers skip notifying.
    pub fn append_chunk(&mut self, chunk: &[u8]) -> Option<String> {
        let buffer = self.buffer.as_mut()?;
        buffer.feed(chunk);
        let rendered = buffer.contents();
        if self.last_render.as_deref() == Some(rendered.as_str()) {
            return None;
        }
        self.last_render = Some(rendered.clone());
        Some(rendered)
    }

    pub fn resize(&mut self, cols: u16, rows: Option<u16>) -> Option<String> {
        let buffer = self.buffer.as_mut()?;
        buffer.set_size(cols, rows.unwrap_or(VIRTUAL_ROWS));
        let rendered = buffer.contents();
        if self.last_render.as_deref() == Some(rendered.as_str()) {
            return None;
        }
        self.last_render = Some(rendered.clone());
        Some(rendered)
    }

    pub fn last_render(&self) -> Option<&str> {
        self.last_render.as_deref()
    }

    pub fn dispose(&mut self) {
        self.buffer = None;
    }
}
