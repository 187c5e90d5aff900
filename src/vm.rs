//! Virtual machine that runs linked programs
//!
//! The machine owns one flat array of words split into the regions of a
//! [`MemoryLayout`]. Values on the operand stack are uniquely owned: reading
//! a composite value out of a slot or through a pointer pushes a deep copy,
//! storing moves the value into place, and whatever is overwritten, popped
//! or left in a discarded frame is deep-freed.

use std::io::{self, Write};

use tracing::{debug, trace};

use crate::{
    bytecode::{Assembler, Program},
    config::{MemoryLayout, VmConfig},
    encoding::{decode_instruction, Opcode, Tag, Value, Word},
    error::Fault,
    heap::HeapTree,
    host::HostRoutine,
};

/// Virtual machine representation
pub struct Vm<W = io::Stdout> {
    memory: Vec<Word>,
    layout: MemoryLayout,
    local_slots: usize,
    heap: HeapTree,

    pc: usize,    // program counter
    depth: usize, // active frames, equal to the number of return addresses
    sp: usize,    // operand stack height
    halted: bool, // set by `end`

    out: W,
}

impl Vm<io::Stdout> {
    /// Assemble `program` and boot a machine with the default configuration.
    pub fn load(program: &str) -> anyhow::Result<Self> {
        let program = Assembler::new(program).assemble()?;
        Self::new(program, VmConfig::default())
    }

    pub fn new(program: Program, config: VmConfig) -> anyhow::Result<Self> {
        Self::with_output(program, config, io::stdout())
    }
}

impl<W: Write> Vm<W> {
    /// Boot a machine whose host routines write to `out`.
    ///
    /// The program is copied into the code region, the program counter is set
    /// to the entry point and one frame is pushed. Returning from that frame
    /// leaves the code region and ends the run.
    pub fn with_output(program: Program, config: VmConfig, out: W) -> anyhow::Result<Self> {
        let layout = MemoryLayout::new(program.words.len(), &config)?;
        let mut memory = vec![0; layout.size()];
        memory[layout.code.clone()].copy_from_slice(&program.words);

        let mut vm = Vm {
            memory,
            heap: HeapTree::new(layout.heap.clone(), config.min_alloc),
            local_slots: config.local_slots,
            pc: program.entry(),
            depth: 0,
            sp: 0,
            halted: false,
            out,
            layout,
        };
        vm.push_frame(vm.layout.code.end)?;

        debug!(
            code = vm.layout.code.len(),
            memory = vm.memory.len(),
            entry = vm.pc,
            "vm booted"
        );
        Ok(vm)
    }

    /// Run until `end`, until the program counter leaves the code region,
    /// or until a fault.
    pub fn run(&mut self) -> Result<(), Fault> {
        if self.halted {
            return Err(Fault::Halted);
        }

        while !self.is_finished() {
            if let Err(fault) = self.step() {
                debug!(pc = self.pc, %fault, "vm fault");
                return Err(fault);
            }
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.halted || !self.layout.code.contains(&self.pc)
    }

    /// Fetch, decode and execute one instruction.
    pub fn step(&mut self) -> Result<(), Fault> {
        if !self.layout.code.contains(&self.pc) {
            return Err(Fault::InvalidAddress {
                op: "fetch",
                addr: self.pc,
            });
        }
        let (op, imm) = decode_instruction(self.memory[self.pc])?;
        trace!(pc = self.pc, op = op.mnemonic(), imm, "step");
        self.pc += 1;

        match op {
            Opcode::Noop => {}
            Opcode::LoadInt => self.push(Value::int(imm))?,
            Opcode::LoadFloat => self.push(Value::new(Tag::Float, imm as u32))?,
            Opcode::LoadStr => self.ins_load_str(imm)?,
            Opcode::LoadVar => self.ins_load_var(imm)?,
            Opcode::LoadVarAddr => {
                let addr = self.slot_addr(imm)?;
                self.push(Value::addr_of(Tag::Pointer, addr))?
            }
            Opcode::LoadMem => self.ins_load_mem()?,
            Opcode::StoreVar => self.ins_store_var(imm)?,
            Opcode::StoreMem => self.ins_store_mem()?,
            Opcode::Call => self.ins_call(imm)?,
            Opcode::CallExt => self.ins_call_ext(imm)?,
            Opcode::Pop => {
                let value = self.pop()?;
                self.deep_free(value)?
            }
            Opcode::Return => self.pc = self.pop_frame()?,
            Opcode::IfJump => self.ins_branch(imm, true)?,
            Opcode::IfNJump => self.ins_branch(imm, false)?,
            Opcode::Jump => self.ins_jump(imm)?,
            Opcode::Not => {
                let value = self.pop()?.expect_int("not")?;
                self.push(Value::int((value == 0) as i32))?
            }
            Opcode::And | Opcode::Or => self.ins_logic(op)?,
            Opcode::Usub => self.ins_usub()?,
            Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Add | Opcode::Sub => {
                self.ins_arith(op)?
            }
            Opcode::Lteq | Opcode::Lt | Opcode::Gt | Opcode::Gteq | Opcode::Eq | Opcode::Neq => {
                self.ins_compare(op)?
            }
            Opcode::Inc => self.ins_inc(imm)?,
            Opcode::ListCreate => self.ins_collection_create(Tag::List, imm)?,
            Opcode::ListAccessPtr => self.ins_access_ptr(Tag::List, "list_access_ptr")?,
            Opcode::ListAccess => self.ins_access(Tag::List, "list_access")?,
            Opcode::ListLength => self.ins_length(Tag::List, "list_length")?,
            Opcode::TupleCreate => self.ins_collection_create(Tag::Tuple, imm)?,
            Opcode::TupleAccessPtr => self.ins_access_ptr(Tag::Tuple, "tuple_access_ptr")?,
            Opcode::TupleAccess => self.ins_access(Tag::Tuple, "tuple_access")?,
            Opcode::ClosureCreate
            | Opcode::ClosureCall
            | Opcode::MapCreate
            | Opcode::MapAdd
            | Opcode::MapAccessPtr
            | Opcode::MapAccess => return Err(Fault::Unsupported(op.mnemonic())),
            Opcode::End => self.halted = true,
        }

        Ok(())
    }

    /// Push a String pointing at an inlined constant
    fn ins_load_str(&mut self, addr: i32) -> Result<(), Fault> {
        let addr = self.code_addr(addr).ok_or(Fault::InvalidAddress {
            op: "load_str",
            addr: addr as usize,
        })?;
        self.push(Value::addr_of(Tag::Str, addr))
    }

    /// Load a copy of a local slot onto the stack
    fn ins_load_var(&mut self, slot: i32) -> Result<(), Fault> {
        let value = self.read_value(self.slot_addr(slot)?)?;
        let value = self.deep_clone(value)?;
        self.push(value)
    }

    /// Pop a pointer and push a copy of the value it points at
    fn ins_load_mem(&mut self) -> Result<(), Fault> {
        let ptr = self.pop()?;
        let addr = self.data_addr(ptr, "load_mem")?;
        let value = self.read_value(addr)?;
        let value = self.deep_clone(value)?;
        self.push(value)
    }

    /// Pop a value from stack and write it to a slot of the current frame
    fn ins_store_var(&mut self, slot: i32) -> Result<(), Fault> {
        let value = self.pop()?;
        let addr = self.slot_addr(slot)?;
        self.store(addr, value)
    }

    /// Pop a value, then a pointer, and write the value through the pointer
    fn ins_store_mem(&mut self) -> Result<(), Fault> {
        let value = self.pop()?;
        let ptr = self.pop()?;
        let addr = self.data_addr(ptr, "store_mem")?;
        self.store(addr, value)
    }

    /// Release the previous occupant of `addr`, then move `value` in.
    fn store(&mut self, addr: usize, value: Value) -> Result<(), Fault> {
        let old = self.read_value(addr)?;
        self.deep_free(old)?;
        self.memory[addr] = value.encode();
        Ok(())
    }

    // Call a function
    fn ins_call(&mut self, target: i32) -> Result<(), Fault> {
        let target = self
            .code_addr(target)
            .ok_or(Fault::InvalidCallTarget(target as usize))?;

        self.push_frame(self.pc)?;
        self.pc = target;
        Ok(())
    }

    fn ins_call_ext(&mut self, index: i32) -> Result<(), Fault> {
        match HostRoutine::from_index(index) {
            Some(HostRoutine::Printf) => self.built_in_printf(),
            Some(HostRoutine::Print) => self.built_in_print(),
            None => Err(Fault::UnknownHostRoutine(index)),
        }
    }

    /// Jump if the popped Int is non-zero (`when` is true) or zero
    fn ins_branch(&mut self, target: i32, when: bool) -> Result<(), Fault> {
        let op = if when { "ifjump" } else { "ifnjump" };
        let cond = self.pop()?.expect_int(op)?;
        if (cond != 0) == when {
            self.ins_jump(target)?;
        }
        Ok(())
    }

    /// Jump to a location. The end of the code region is a valid target and
    /// finishes the run.
    fn ins_jump(&mut self, target: i32) -> Result<(), Fault> {
        if target < 0 || target as usize > self.layout.code.end {
            return Err(Fault::InvalidAddress {
                op: "jump",
                addr: target as usize,
            });
        }
        self.pc = target as usize;
        Ok(())
    }

    fn ins_logic(&mut self, op: Opcode) -> Result<(), Fault> {
        let lhs = self.pop()?.expect_int(op.mnemonic())?;
        let rhs = self.pop()?.expect_int(op.mnemonic())?;
        let result = match op {
            Opcode::And => lhs != 0 && rhs != 0,
            _ => lhs != 0 || rhs != 0,
        };
        self.push(Value::int(result as i32))
    }

    fn ins_usub(&mut self) -> Result<(), Fault> {
        let value = self.pop()?;
        let negated = match value.tag {
            Tag::Int => Value::int(value.as_int().wrapping_neg()),
            Tag::Float => Value::float(-value.as_float()),
            found => {
                return Err(Fault::TypeMismatch {
                    op: "usub",
                    expected: "number",
                    found,
                })
            }
        };
        self.push(negated)
    }

    /// Binary arithmetic. The left operand is on top of the stack. Two Ints
    /// give an Int, any Float operand promotes the result to Float.
    fn ins_arith(&mut self, op: Opcode) -> Result<(), Fault> {
        let name = op.mnemonic();
        let lhs = self.pop()?;
        let rhs = self.pop()?;

        if op == Opcode::Add && lhs.tag == Tag::List {
            return self.list_add(lhs, rhs);
        }
        if op == Opcode::Mod {
            lhs.expect_int(name)?;
            rhs.expect_int(name)?;
        }
        let lhs = numeric(lhs, name)?;
        let rhs = numeric(rhs, name)?;

        let result = if lhs.tag == Tag::Int && rhs.tag == Tag::Int {
            let (a, b) = (lhs.as_int(), rhs.as_int());
            if matches!(op, Opcode::Div | Opcode::Mod) && b == 0 {
                return Err(Fault::DivisionByZero);
            }
            Value::int(match op {
                Opcode::Add => a.wrapping_add(b),
                Opcode::Sub => a.wrapping_sub(b),
                Opcode::Mul => a.wrapping_mul(b),
                Opcode::Div => a.wrapping_div(b),
                _ => a.wrapping_rem(b),
            })
        } else {
            let (a, b) = (lhs.to_f32(), rhs.to_f32());
            Value::float(match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                _ => a / b,
            })
        };

        self.push(result)
    }

    fn ins_compare(&mut self, op: Opcode) -> Result<(), Fault> {
        let name = op.mnemonic();
        let lhs = numeric(self.pop()?, name)?;
        let rhs = numeric(self.pop()?, name)?;

        let ordering = if lhs.tag == Tag::Int && rhs.tag == Tag::Int {
            Some(lhs.as_int().cmp(&rhs.as_int()))
        } else {
            lhs.to_f32().partial_cmp(&rhs.to_f32())
        };

        // NaN compares unequal to everything
        let result = match (op, ordering) {
            (Opcode::Neq, None) => true,
            (_, None) => false,
            (Opcode::Lteq, Some(o)) => o.is_le(),
            (Opcode::Lt, Some(o)) => o.is_lt(),
            (Opcode::Gt, Some(o)) => o.is_gt(),
            (Opcode::Gteq, Some(o)) => o.is_ge(),
            (Opcode::Eq, Some(o)) => o.is_eq(),
            (_, Some(o)) => o.is_ne(),
        };
        self.push(Value::int(result as i32))
    }

    /// Pop an Int and add it to the Int held in a local slot
    fn ins_inc(&mut self, slot: i32) -> Result<(), Fault> {
        let amount = self.pop()?.expect_int("inc")?;
        let addr = self.slot_addr(slot)?;
        let current = self.read_value(addr)?.expect_int("inc")?;
        self.memory[addr] = Value::int(current.wrapping_add(amount)).encode();
        Ok(())
    }

    /// Pop `count` values into a fresh block. The first value popped becomes
    /// element 0.
    fn ins_collection_create(&mut self, tag: Tag, count: i32) -> Result<(), Fault> {
        if count < 0 {
            return Err(Fault::IndexOutOfBounds {
                index: count,
                len: 0,
            });
        }
        let len = count as usize;
        let addr = self.heap.alloc(len + 1)?;
        self.memory[addr] = len as Word;
        for i in 0..len {
            let value = self.pop()?;
            self.memory[addr + 1 + i] = value.encode();
        }
        self.push(Value::addr_of(tag, addr))
    }

    /// Pop an index and a container, push a pointer to the element
    fn ins_access_ptr(&mut self, tag: Tag, op: &'static str) -> Result<(), Fault> {
        let (elem, _) = self.element(tag, op)?;
        self.push(Value::addr_of(Tag::Pointer, elem))
    }

    /// Pop an index and a container, push a copy of the element. A temporary
    /// container gives its element up and is released.
    fn ins_access(&mut self, tag: Tag, op: &'static str) -> Result<(), Fault> {
        let (elem, temporary) = self.element(tag, op)?;
        let value = self.read_value(elem)?;

        let value = match temporary {
            Some(container) => {
                self.memory[elem] = Value::NIL.encode();
                self.deep_free(container)?;
                value
            }
            None => self.deep_clone(value)?,
        };
        self.push(value)
    }

    fn ins_length(&mut self, tag: Tag, op: &'static str) -> Result<(), Fault> {
        let container = self.pop()?;
        let (block, temporary) = self.container(container, tag, op)?;
        let len = self.block_len(block)?;
        if let Some(container) = temporary {
            self.deep_free(container)?;
        }
        self.push(Value::int(len as i32))
    }

    /// Resolve the operands of an element access to the element's address.
    /// The second result is the container itself when it was a temporary.
    fn element(&mut self, tag: Tag, op: &'static str) -> Result<(usize, Option<Value>), Fault> {
        let index = self.pop()?.expect_int(op)?;
        let container = self.pop()?;
        let (block, temporary) = self.container(container, tag, op)?;

        let len = self.block_len(block)?;
        if index < 0 || index as usize >= len {
            return Err(Fault::IndexOutOfBounds { index, len });
        }
        Ok((block + 1 + index as usize, temporary))
    }

    /// A container operand is either a collection value or a pointer to a
    /// location holding one.
    fn container(
        &self,
        container: Value,
        tag: Tag,
        op: &'static str,
    ) -> Result<(usize, Option<Value>), Fault> {
        let expected = collection_name(tag);
        if container.tag == tag {
            return Ok((container.addr(), Some(container)));
        }

        let addr = self
            .data_addr(container, op)
            .map_err(|_| Fault::TypeMismatch {
                op,
                expected,
                found: container.tag,
            })?;
        let inner = self.read_value(addr)?.expect(tag, op, expected)?;
        Ok((inner.addr(), None))
    }

    /// `List + List` concatenates, `List + value` appends. Both operands are
    /// consumed; their elements move into the new block.
    fn list_add(&mut self, lhs: Value, rhs: Value) -> Result<(), Fault> {
        let left = lhs.addr();
        let left_len = self.block_len(left)?;
        let right_len = match rhs.tag {
            Tag::List => self.block_len(rhs.addr())?,
            _ => 1,
        };

        let len = left_len + right_len;
        let addr = self.heap.alloc(len + 1)?;
        self.memory[addr] = len as Word;
        self.memory.copy_within(left + 1..left + 1 + left_len, addr + 1);

        if rhs.tag == Tag::List {
            let right = rhs.addr();
            self.memory.copy_within(right + 1..right + 1 + right_len, addr + 1 + left_len);
            self.heap.free(right)?;
        } else {
            self.memory[addr + 1 + left_len] = rhs.encode();
        }
        self.heap.free(left)?;

        self.push(Value::addr_of(Tag::List, addr))
    }

    /// Pops a format string and one value per conversion and prints them.
    fn built_in_printf(&mut self) -> Result<(), Fault> {
        let format = self.pop()?.expect(Tag::Str, "printf", "string")?;
        let format = self.read_bytes(format.addr())?;

        let mut text = Vec::new();
        let mut bytes = format.iter().copied();
        while let Some(b) = bytes.next() {
            if b != b'%' {
                text.push(b);
                continue;
            }
            match bytes.next() {
                Some(b'd' | b'i') => {
                    let value = numeric(self.pop()?, "printf")?;
                    let value = match value.tag {
                        Tag::Float => value.as_float() as i32,
                        _ => value.as_int(),
                    };
                    text.extend_from_slice(value.to_string().as_bytes());
                }
                Some(b'f' | b'g') => {
                    let value = numeric(self.pop()?, "printf")?;
                    text.extend_from_slice(value.to_f32().to_string().as_bytes());
                }
                Some(b'%') => text.push(b'%'),
                Some(other) => text.extend([b'%', other]),
                None => text.push(b'%'),
            }
        }

        self.write_out(&text)?;
        self.push(Value::int(text.len() as i32))
    }

    /// Pops a value and prints it on its own line.
    fn built_in_print(&mut self) -> Result<(), Fault> {
        let value = self.pop()?;
        let mut text = self.render(value)?;
        text.push('\n');
        self.write_out(text.as_bytes())?;
        self.deep_free(value)?;
        self.push(Value::NIL)
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<(), Fault> {
        self.out
            .write_all(bytes)
            .map_err(|e| Fault::Output(e.to_string()))
    }

    /// Human readable form of a value, following strings and collections
    pub fn render(&self, value: Value) -> Result<String, Fault> {
        let (open, close) = match value.tag {
            Tag::Str => return self.read_string(value),
            Tag::List => ('[', ']'),
            Tag::Tuple => ('(', ')'),
            _ => return Ok(value.to_string()),
        };

        let mut text = String::from(open);
        for (i, elem) in self.collection_values(value)?.into_iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            text += &self.render(elem)?;
        }
        text.push(close);
        Ok(text)
    }

    /// Contents of a String value
    pub fn read_string(&self, value: Value) -> Result<String, Fault> {
        let value = value.expect(Tag::Str, "read_string", "string")?;
        let bytes = self.read_bytes(value.addr())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Elements of a List or Tuple value
    pub fn collection_values(&self, value: Value) -> Result<Vec<Value>, Fault> {
        if !matches!(value.tag, Tag::List | Tag::Tuple) {
            return Err(Fault::TypeMismatch {
                op: "collection_values",
                expected: "list",
                found: value.tag,
            });
        }
        let addr = value.addr();
        (0..self.block_len(addr)?)
            .map(|i| self.read_value(addr + 1 + i))
            .collect()
    }

    /// Zero-terminated bytes of an inlined constant
    fn read_bytes(&self, addr: usize) -> Result<Vec<u8>, Fault> {
        let mut bytes = Vec::new();
        for word_addr in addr..self.layout.code.end {
            for b in self.memory[word_addr].to_le_bytes() {
                if b == 0 {
                    return Ok(bytes);
                }
                bytes.push(b);
            }
        }
        Err(Fault::InvalidAddress {
            op: "read_string",
            addr,
        })
    }

    /// Copy a value; collections are copied element by element into new blocks.
    fn deep_clone(&mut self, value: Value) -> Result<Value, Fault> {
        if !value.tag.is_composite() {
            return Ok(value);
        }

        let src = value.addr();
        let len = self.block_len(src)?;
        let dst = self.heap.alloc(len + 1)?;
        self.memory[dst] = len as Word;
        for i in 1..=len {
            let elem = self.read_value(src + i)?;
            let elem = self.deep_clone(elem)?;
            self.memory[dst + i] = elem.encode();
        }
        Ok(Value::addr_of(value.tag, dst))
    }

    /// Release a value's heap storage and everything it transitively owns.
    /// Pointers do not own what they point at.
    fn deep_free(&mut self, value: Value) -> Result<(), Fault> {
        if !value.tag.is_composite() {
            return Ok(());
        }

        let addr = value.addr();
        for i in 1..=self.block_len(addr)? {
            let elem = self.read_value(addr + i)?;
            self.deep_free(elem)?;
        }
        self.heap.free(addr)?;
        Ok(())
    }

    /// Length header of a collection block
    fn block_len(&self, addr: usize) -> Result<usize, Fault> {
        let heap = &self.layout.heap;
        if !heap.contains(&addr) {
            return Err(Fault::InvalidAddress { op: "block", addr });
        }
        let len = self.memory[addr] as usize;
        if len >= heap.end - addr {
            return Err(Fault::InvalidAddress { op: "block", addr });
        }
        Ok(len)
    }

    fn push_frame(&mut self, ret_addr: usize) -> Result<(), Fault> {
        if self.depth == self.layout.return_stack.len() {
            return Err(Fault::CallStackOverflow);
        }
        self.memory[self.layout.return_stack.start + self.depth] = ret_addr as Word;

        let frame = self.layout.frames.start + self.depth * self.local_slots;
        self.memory[frame..frame + self.local_slots].fill(0);
        self.depth += 1;
        Ok(())
    }

    /// Discard the current frame, releasing its slots, and return the
    /// address to resume at.
    fn pop_frame(&mut self) -> Result<usize, Fault> {
        if self.depth == 0 {
            return Err(Fault::CallStackUnderflow);
        }

        let frame = self.layout.frames.start + (self.depth - 1) * self.local_slots;
        for addr in frame..frame + self.local_slots {
            let value = self.read_value(addr)?;
            self.memory[addr] = 0;
            self.deep_free(value)?;
        }

        self.depth -= 1;
        Ok(self.memory[self.layout.return_stack.start + self.depth] as usize)
    }

    /// Address of a local slot of the current frame
    fn slot_addr(&self, slot: i32) -> Result<usize, Fault> {
        if slot < 0 || slot as usize >= self.local_slots {
            return Err(Fault::InvalidSlot(slot));
        }
        if self.depth == 0 {
            return Err(Fault::CallStackUnderflow);
        }
        Ok(self.layout.frames.start + (self.depth - 1) * self.local_slots + slot as usize)
    }

    fn code_addr(&self, addr: i32) -> Option<usize> {
        usize::try_from(addr)
            .ok()
            .filter(|a| self.layout.code.contains(a))
    }

    /// Target of a data pointer: a slot of a live frame or a heap word.
    fn data_addr(&self, ptr: Value, op: &'static str) -> Result<usize, Fault> {
        let addr = ptr.expect(Tag::Pointer, op, "pointer")?.addr();
        let live_frames = self.layout.frames.start
            ..self.layout.frames.start + self.depth * self.local_slots;

        if live_frames.contains(&addr) || self.heap.contains(addr) {
            Ok(addr)
        } else {
            Err(Fault::InvalidAddress { op, addr })
        }
    }

    fn read_value(&self, addr: usize) -> Result<Value, Fault> {
        match self.memory.get(addr) {
            Some(&word) => Value::decode(word),
            None => Err(Fault::InvalidAddress { op: "read", addr }),
        }
    }

    fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.sp == self.layout.operand_stack.len() {
            return Err(Fault::OperandStackOverflow);
        }
        self.memory[self.layout.operand_stack.start + self.sp] = value.encode();
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        if self.sp == 0 {
            return Err(Fault::OperandStackUnderflow);
        }
        self.sp -= 1;
        Value::decode(self.memory[self.layout.operand_stack.start + self.sp])
    }

    /// Top of the operand stack
    pub fn peek(&self) -> Result<Value, Fault> {
        match self.sp {
            0 => Err(Fault::OperandStackUnderflow),
            sp => self.read_value(self.layout.operand_stack.start + sp - 1),
        }
    }

    /// Operand stack contents, bottom first
    pub fn operand_stack(&self) -> Result<Vec<Value>, Fault> {
        let start = self.layout.operand_stack.start;
        (start..start + self.sp)
            .map(|addr| self.read_value(addr))
            .collect()
    }

    /// A local slot of the current frame
    pub fn local(&self, slot: i32) -> Result<Value, Fault> {
        self.read_value(self.slot_addr(slot)?)
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn heap(&self) -> &HeapTree {
        &self.heap
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }
}

fn numeric(value: Value, op: &'static str) -> Result<Value, Fault> {
    if value.tag.is_numeric() {
        Ok(value)
    } else {
        Err(Fault::TypeMismatch {
            op,
            expected: "number",
            found: value.tag,
        })
    }
}

fn collection_name(tag: Tag) -> &'static str {
    match tag {
        Tag::Tuple => "tuple",
        _ => "list",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot(program: &str) -> Vm<Vec<u8>> {
        boot_with(program, VmConfig::default())
    }

    fn boot_with(program: &str, config: VmConfig) -> Vm<Vec<u8>> {
        let program = Assembler::new(program).assemble().unwrap();
        Vm::with_output(program, config, Vec::new()).unwrap()
    }

    fn run(program: &str) -> Vm<Vec<u8>> {
        let mut vm = boot(program);
        vm.run().unwrap();
        vm
    }

    fn fault(program: &str) -> Fault {
        boot(program).run().unwrap_err()
    }

    fn stdout(vm: &Vm<Vec<u8>>) -> String {
        String::from_utf8(vm.output().clone()).unwrap()
    }

    #[test]
    fn load() {
        let vm = run("load_int 10\nload_int 20\nload_float 2.5\nend");
        assert_eq!(
            vm.operand_stack().unwrap(),
            vec![Value::int(10), Value::int(20), Value::float(2.5)]
        );
        assert!(vm.is_halted());
    }

    #[test]
    fn read_write() {
        let vm = run("load_int 10\nstore_var 0\nload_int 20\nload_var 0\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(10));
        assert_eq!(vm.local(0).unwrap(), Value::int(10));
        assert_eq!(vm.operand_stack().unwrap().len(), 2);
    }

    #[test]
    fn return_from_entry_frame_finishes() {
        let vm = run("load_int 3\nload_int 4\nadd\nreturn");
        assert_eq!(vm.peek().unwrap(), Value::int(7));
        assert_eq!(vm.depth(), 0);
        assert!(!vm.is_halted());
        assert!(vm.is_finished());
    }

    #[test]
    fn arithmetic() {
        // The left operand is pushed last
        let vm = run("load_int 4\nload_int 6\nsub\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(2));

        let vm = run("load_int 4\nload_int 6\nmul\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(24));

        let vm = run("load_int 2\nload_int 7\ndiv\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(3));

        let vm = run("load_int 2\nload_int 7\nmod\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(1));

        let vm = run("load_int 5\nusub\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(-5));
    }

    #[test]
    fn float_promotion() {
        let vm = run("load_float 1.5\nload_int 2\nadd\nend");
        assert_eq!(vm.peek().unwrap(), Value::float(3.5));

        let vm = run("load_int 2\nload_float 1.0\ndiv\nend");
        assert_eq!(vm.peek().unwrap(), Value::float(0.5));

        let vm = run("load_float 1.5\nusub\nend");
        assert_eq!(vm.peek().unwrap(), Value::float(-1.5));
    }

    #[test]
    fn arithmetic_faults() {
        assert_eq!(
            fault("load_float 2.0\nload_int 7\nmod\nend"),
            Fault::TypeMismatch {
                op: "mod",
                expected: "int",
                found: Tag::Float
            }
        );
        assert_eq!(fault("load_int 0\nload_int 7\ndiv\nend"), Fault::DivisionByZero);
        assert_eq!(fault("load_int 1\nadd\nend"), Fault::OperandStackUnderflow);
        assert!(matches!(
            fault("load_str s\nload_int 1\nadd\nend\ns: \"x\""),
            Fault::TypeMismatch { op: "add", .. }
        ));
    }

    #[test]
    fn compare_and_logic() {
        let vm = run("load_int 3\nload_int 2\nlt\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(1));

        let vm = run("load_float 2.5\nload_int 3\ngteq\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(1));

        let vm = run("load_int 1\nload_int 1\nneq\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(0));

        let vm = run("load_int 0\nload_int 1\nand\nload_int 0\nor\nnot\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(1));

        assert!(matches!(
            fault("load_float 1.0\nload_int 1\nand\nend"),
            Fault::TypeMismatch { op: "and", .. }
        ));
    }

    #[test]
    fn jmp() {
        let vm = run("jump over\nload_int 1\nover:\nload_int 2\nend");
        assert_eq!(vm.operand_stack().unwrap(), vec![Value::int(2)]);

        let vm = run("load_int 0\nifjump skip\nload_int 1\nskip:\nend");
        assert_eq!(vm.operand_stack().unwrap(), vec![Value::int(1)]);

        let vm = run("load_int 0\nifnjump skip\nload_int 1\nskip:\nend");
        assert!(vm.operand_stack().unwrap().is_empty());

        assert!(matches!(
            fault("jump -1"),
            Fault::InvalidAddress { op: "jump", .. }
        ));
        assert!(matches!(
            fault("load_float 1.0\nifjump 0"),
            Fault::TypeMismatch { op: "ifjump", .. }
        ));
    }

    #[test]
    fn jump_to_code_end_finishes() {
        let vm = run("jump done\nload_int 1\ndone:");
        assert!(vm.operand_stack().unwrap().is_empty());
    }

    #[test]
    fn call_and_return() {
        let program = "
            .func main 0
            load_int 5
            load_int 4
            call add2
            end

            .func add2 2
            store_var 0
            store_var 1
            load_var 1
            load_var 0
            add
            return
        ";
        let vm = run(program);
        assert_eq!(vm.operand_stack().unwrap(), vec![Value::int(9)]);
        assert_eq!(vm.depth(), 1);
    }

    #[test]
    fn call_faults() {
        assert_eq!(fault("call 99"), Fault::InvalidCallTarget(99));
        assert_eq!(fault("noop\nnoop\ncall_ext 9"), Fault::UnknownHostRoutine(9));

        let mut vm = boot_with("loop:\ncall loop", VmConfig::default().with_max_call_depth(8));
        assert_eq!(vm.run(), Err(Fault::CallStackOverflow));
        assert_eq!(vm.depth(), 8);
    }

    #[test]
    fn operand_stack_overflow() {
        let mut vm = boot_with(
            "loop:\nload_int 1\njump loop",
            VmConfig::default().with_operand_stack_size(16),
        );
        assert_eq!(vm.run(), Err(Fault::OperandStackOverflow));
    }

    #[test]
    fn local_slot_bounds() {
        let mut vm = boot_with("load_int 1\nstore_var 4", VmConfig::default().with_local_slots(4));
        assert_eq!(vm.run(), Err(Fault::InvalidSlot(4)));
    }

    #[test]
    fn inc() {
        let vm = run("load_int 40\nstore_var 2\nload_int 2\ninc 2\nend");
        assert_eq!(vm.local(2).unwrap(), Value::int(42));

        assert!(matches!(
            fault("load_int 1\ninc 0\nend"),
            Fault::TypeMismatch { op: "inc", found: Tag::Nil, .. }
        ));
    }

    #[test]
    fn pointers_to_slots() {
        let vm = run("load_var_addr 1\nload_int 7\nstore_mem\nload_var_addr 1\nload_mem\nend");
        assert_eq!(vm.local(1).unwrap(), Value::int(7));
        assert_eq!(vm.peek().unwrap(), Value::int(7));

        assert!(matches!(
            fault("load_int 3\nload_mem\nend"),
            Fault::TypeMismatch { op: "load_mem", .. }
        ));
    }

    #[test]
    fn list_create_and_access() {
        let program = "load_int 30\nload_int 20\nload_int 10\nlist_create 3\nstore_var 0\n\
                       load_var_addr 0\nload_int 1\nlist_access\n\
                       load_var_addr 0\nlist_length\nend";
        let vm = run(program);
        assert_eq!(vm.operand_stack().unwrap(), vec![Value::int(20), Value::int(3)]);

        let list = vm.local(0).unwrap();
        assert_eq!(list.tag, Tag::List);
        assert_eq!(
            vm.collection_values(list).unwrap(),
            vec![Value::int(10), Value::int(20), Value::int(30)]
        );
        assert_eq!(vm.heap().live(), 1);
    }

    #[test]
    fn list_access_out_of_bounds() {
        let program = "load_int 1\nload_int 2\nload_int 3\nlist_create 3\n\
                       load_int 5\nlist_access_ptr\nend";
        assert_eq!(fault(program), Fault::IndexOutOfBounds { index: 5, len: 3 });

        let program = "load_int 1\nload_int 2\nload_int 3\nlist_create 3\n\
                       load_int -1\nlist_access\nend";
        assert_eq!(fault(program), Fault::IndexOutOfBounds { index: -1, len: 3 });
    }

    #[test]
    fn temporary_list_access_releases_block() {
        let vm = run("load_int 2\nload_int 1\nlist_create 2\nload_int 0\nlist_access\nend");
        assert_eq!(vm.peek().unwrap(), Value::int(1));
        assert!(vm.heap().is_pristine());
    }

    #[test]
    fn store_through_element_pointer() {
        let program = "load_int 0\nload_int 0\nlist_create 2\nstore_var 0\n\
                       load_var_addr 0\nload_int 1\nlist_access_ptr\nload_int 9\nstore_mem\nend";
        let vm = run(program);
        let list = vm.local(0).unwrap();
        assert_eq!(
            vm.collection_values(list).unwrap(),
            vec![Value::int(0), Value::int(9)]
        );
    }

    #[test]
    fn list_concat_and_append() {
        // [1, 2] + [3, 4], then append 5
        let program = "load_int 4\nload_int 3\nlist_create 2\n\
                       load_int 2\nload_int 1\nlist_create 2\nadd\nstore_var 0\n\
                       load_int 5\nload_var 0\nadd\nstore_var 0\nend";
        let vm = run(program);
        let list = vm.local(0).unwrap();
        assert_eq!(
            vm.collection_values(list).unwrap(),
            (1..=5).map(Value::int).collect::<Vec<_>>()
        );
        assert_eq!(vm.heap().live(), 1);
    }

    #[test]
    fn load_var_copies_lists() {
        let program = "load_int 1\nlist_create 1\nstore_var 0\nload_var 0\nstore_var 1\nend";
        let vm = run(program);
        assert_ne!(vm.local(0).unwrap(), vm.local(1).unwrap());
        assert_eq!(vm.heap().live(), 2);
    }

    #[test]
    fn overwrite_deep_frees_exactly_once() {
        // A list of primitives is one block
        let program = "load_int 1\nload_int 2\nlist_create 2\nstore_var 0\n\
                       load_int 0\nstore_var 0\nend";
        let vm = run(program);
        assert_eq!(vm.heap().total_frees(), 1);
        assert!(vm.heap().is_pristine());

        // A list of two lists is three blocks
        let program = "load_int 1\nlist_create 1\nload_int 2\nlist_create 1\nlist_create 2\n\
                       store_var 0\nload_int 0\nstore_var 0\nend";
        let vm = run(program);
        assert_eq!(vm.heap().total_allocs(), 3);
        assert_eq!(vm.heap().total_frees(), 3);
        assert!(vm.heap().is_pristine());
    }

    #[test]
    fn return_releases_frame() {
        let program = "
            .func main 0
            call make
            pop
            end

            .func make 0
            load_int 1
            list_create 1
            store_var 0
            load_var 0
            return
        ";
        let vm = run(program);
        assert!(vm.heap().is_pristine());
        assert_eq!(vm.heap().total_frees(), vm.heap().total_allocs());
    }

    #[test]
    fn tuples() {
        let vm = run("load_float 0.5\nload_int 1\ntuple_create 2\nload_int 1\ntuple_access\nend");
        assert_eq!(vm.peek().unwrap(), Value::float(0.5));

        assert!(matches!(
            fault("load_int 1\nlist_create 1\nload_int 0\ntuple_access\nend"),
            Fault::TypeMismatch { op: "tuple_access", .. }
        ));
    }

    #[test]
    fn reserved_opcodes() {
        assert_eq!(fault("map_create"), Fault::Unsupported("map_create"));
        assert_eq!(fault("closure_create 0"), Fault::Unsupported("closure_create"));
    }

    #[test]
    fn printf() {
        let program = "load_float 2.5\nload_int 42\nload_str fmt\ncall_ext printf\nend\n\
                       fmt: \"answer=%d half=%f 100%%\\n\"";
        let vm = run(program);
        assert_eq!(stdout(&vm), "answer=42 half=2.5 100%\n");
        assert_eq!(vm.operand_stack().unwrap(), vec![Value::int(24)]);
    }

    #[test]
    fn print() {
        let program = "load_str s\nload_float 1.5\nload_int 1\nlist_create 3\ncall_ext print\nend\n\
                       s: \"hi\"";
        let vm = run(program);
        assert_eq!(stdout(&vm), "[1, 1.5, hi]\n");
        assert_eq!(vm.peek().unwrap(), Value::NIL);
        assert!(vm.heap().is_pristine());
    }

    #[test]
    fn heap_exhaustion() {
        let mut vm = boot_with(
            "loop:\nload_int 0\nlist_create 1\njump loop",
            VmConfig::default().with_heap_size(64),
        );
        assert!(matches!(vm.run(), Err(Fault::HeapExhausted(_))));
    }

    #[test]
    fn run_after_end() {
        let mut vm = run("end");
        assert_eq!(vm.run(), Err(Fault::Halted));
    }
}
