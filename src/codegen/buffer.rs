use super::emitter::EmitError;

const INITIAL_CAPACITY: usize = 256;

/// Growable machine-code buffer with a hard size limit.
///
/// Capacity doubles on overflow. Running past the limit, or failing to
/// allocate, is reported as [`EmitError::OutOfMemory`] instead of aborting.
/// The buffer also records where each instruction starts so later passes
/// never mistake immediates or inline data for opcodes.
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    limit: usize,
    marks: Vec<usize>,
}

impl CodeBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity: 0,
            limit,
            marks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn marks(&self) -> &[usize] {
        &self.marks
    }

    fn reserve(&mut self, extra: usize) -> Result<(), EmitError> {
        let requested = self.bytes.len().saturating_add(extra);
        if requested > self.limit {
            return Err(EmitError::OutOfMemory {
                requested,
                limit: self.limit,
            });
        }
        if requested <= self.capacity {
            return Ok(());
        }

        let mut capacity = self.capacity.max(INITIAL_CAPACITY.min(self.limit));
        while capacity < requested {
            capacity = capacity.saturating_mul(2).min(self.limit);
        }
        self.bytes
            .try_reserve_exact(capacity - self.bytes.len())
            .map_err(|_| EmitError::OutOfMemory {
                requested: capacity,
                limit: self.limit,
            })?;
        self.capacity = capacity;
        Ok(())
    }

    pub fn emit_u8(&mut self, b: u8) -> Result<(), EmitError> {
        self.reserve(1)?;
        self.bytes.push(b);
        Ok(())
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), EmitError> {
        self.reserve(bytes.len())?;
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    pub fn emit_u32(&mut self, v: u32) -> Result<(), EmitError> {
        self.emit_bytes(&v.to_le_bytes())
    }

    pub fn emit_i32(&mut self, v: i32) -> Result<(), EmitError> {
        self.emit_bytes(&v.to_le_bytes())
    }

    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Record that an instruction starts at the current offset.
    pub fn mark_instruction(&mut self) {
        let here = self.bytes.len();
        if self.marks.last() != Some(&here) {
            self.marks.push(here);
        }
    }

    /// Drop everything from `len` on, marks included (a mark at `len` stays).
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
        while self.marks.last().is_some_and(|&m| m > len) {
            self.marks.pop();
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<usize>) {
        (self.bytes, self.marks)
    }
}
