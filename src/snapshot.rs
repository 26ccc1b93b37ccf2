/// Separator between per-thread blocks in a stack dump.
pub const BLOCK_DELIMITER: &str = "\n\n";

/// Raw per-thread stack text captured at one instant.
///
/// Each block is a header line followed by the rendered frames of one
/// thread. A snapshot owns its text and is never modified after capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSnapshot {
    blocks: Vec<String>,
    truncated: bool,
}

impl StackSnapshot {
    /// Splits a full dump into blocks on [`BLOCK_DELIMITER`].
    pub fn from_dump(dump: &str) -> Self {
        if dump.is_empty() {
            return Self::default();
        }
        Self::from_blocks(dump.split(BLOCK_DELIMITER))
    }

    pub fn from_blocks<I, B>(blocks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<String>,
    {
        Self {
            blocks: blocks.into_iter().map(Into::into).collect(),
            truncated: false,
        }
    }

    /// Marks the snapshot as cut short by the capture buffer.
    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn blocks(&self) -> &[String] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns `true` when the dump did not fit into the capture buffer and
    /// the trailing blocks are missing or partial.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Size-bounded dump text, written one block at a time.
#[derive(Debug)]
pub(crate) struct DumpBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl DumpBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Appends a block, cutting it at the limit when it does not fit.
    pub(crate) fn push_block(&mut self, block: &str) {
        if self.truncated {
            return;
        }
        let sep = if self.text.is_empty() { "" } else { BLOCK_DELIMITER };
        let room = self.limit.saturating_sub(self.text.len());
        if sep.len() + block.len() <= room {
            self.text.push_str(sep);
            self.text.push_str(block);
            return;
        }

        self.truncated = true;
        let joined = format!("{sep}{block}");
        let mut cut = room;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&joined[..cut]);
    }

    pub(crate) fn finish(self) -> StackSnapshot {
        StackSnapshot::from_dump(&self.text).with_truncated(self.truncated)
    }
}
