//! Machine configuration and address-space layout

use std::ops::Range;

use anyhow::{bail, ensure};

/// Sizes of the statically allocated regions of a virtual machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Local-variable slots per call frame
    pub local_slots: usize,
    /// Maximum number of simultaneously active calls
    pub max_call_depth: usize,
    /// Capacity of the operand stack in words
    pub operand_stack_size: usize,
    /// Size of the heap in words
    pub heap_size: usize,
    /// Nodes smaller than this are never split further
    pub min_alloc: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            local_slots: 32,
            max_call_depth: 256,
            operand_stack_size: 1024,
            heap_size: 1 << 16,
            min_alloc: 4,
        }
    }
}

impl VmConfig {
    pub fn with_local_slots(mut self, slots: usize) -> Self {
        self.local_slots = slots;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_operand_stack_size(mut self, size: usize) -> Self {
        self.operand_stack_size = size;
        self
    }

    pub fn with_heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    pub fn with_min_alloc(mut self, size: usize) -> Self {
        self.min_alloc = size;
        self
    }
}

/// The disjoint regions of the flat address space, in address order:
/// code, call frames, return addresses, operand stack, heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub code: Range<usize>,
    pub frames: Range<usize>,
    pub return_stack: Range<usize>,
    pub operand_stack: Range<usize>,
    pub heap: Range<usize>,
}

impl MemoryLayout {
    /// Lay the regions out back to back after `code_len` words of code.
    pub fn new(code_len: usize, config: &VmConfig) -> anyhow::Result<Self> {
        ensure!(config.local_slots > 0, "frames need at least one local slot");
        ensure!(config.max_call_depth > 0, "call depth must be positive");
        ensure!(config.operand_stack_size > 0, "operand stack must be non-empty");
        ensure!(config.heap_size > 0, "heap must be non-empty");
        ensure!(config.min_alloc > 0, "minimum allocation must be positive");

        let code = 0..code_len;
        let frames = code.end..code.end + config.local_slots * config.max_call_depth;
        let return_stack = frames.end..frames.end + config.max_call_depth;
        let operand_stack = return_stack.end..return_stack.end + config.operand_stack_size;
        let heap = operand_stack.end..operand_stack.end + config.heap_size;

        // Every address must be expressible in a value payload and an immediate
        if heap.end > i32::MAX as usize {
            bail!(
                "address space of {} words exceeds the immediate range",
                heap.end
            );
        }

        Ok(MemoryLayout {
            code,
            frames,
            return_stack,
            operand_stack,
            heap,
        })
    }

    /// Total number of words in the address space
    pub fn size(&self) -> usize {
        self.heap.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_disjoint_and_ordered() {
        let config = VmConfig::default()
            .with_local_slots(4)
            .with_max_call_depth(8)
            .with_operand_stack_size(16)
            .with_heap_size(64);
        let layout = MemoryLayout::new(10, &config).unwrap();

        assert_eq!(layout.code, 0..10);
        assert_eq!(layout.frames, 10..42);
        assert_eq!(layout.return_stack, 42..50);
        assert_eq!(layout.operand_stack, 50..66);
        assert_eq!(layout.heap, 66..130);
        assert_eq!(layout.size(), 130);
    }

    #[test]
    fn rejects_oversized_space() {
        let config = VmConfig::default().with_heap_size(i32::MAX as usize);
        assert!(MemoryLayout::new(0, &config).is_err());
    }

    #[test]
    fn rejects_empty_regions() {
        let config = VmConfig::default().with_local_slots(0);
        assert!(MemoryLayout::new(0, &config).is_err());
    }
}
