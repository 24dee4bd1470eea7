// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of submission and completion queues.

use super::spec;
use crate::doorbell::ShadowDoorbell;
use crate::registers::DeviceRegisters;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use user_driver::memory::MemoryBlock;
use user_driver::DeviceBacking;

pub(crate) struct SubmissionQueue {
    sqid: u16,
    head: u32,
    tail: u32,
    last_tail: u32,
    len: u32,
    mem: MemoryBlock,
    db_offset: usize,
    shadow: Option<ShadowDoorbell>,
}

#[derive(Debug)]
pub(crate) struct QueueFull;

impl SubmissionQueue {
    pub fn new(sqid: u16, len: u16, mem: MemoryBlock, db_offset: usize) -> Self {
        Self {
            sqid,
            head: 0,
            tail: 0,
            last_tail: 0,
            len: len.into(),
            mem,
            db_offset,
            shadow: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.sqid
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Resets the indices for a newly created queue.
    pub fn reset(&mut self, db_offset: usize, shadow: Option<ShadowDoorbell>) {
        self.head = 0;
        self.tail = 0;
        self.last_tail = 0;
        self.db_offset = db_offset;
        self.shadow = shadow;
    }

    pub fn set_shadow(&mut self, shadow: Option<ShadowDoorbell>) {
        self.shadow = shadow;
    }

    pub fn update_head(&mut self, head: u16) {
        let head = head as u32;
        if head < self.len {
            self.head = head;
        }
    }

    pub fn is_full(&self) -> bool {
        advance(self.tail, self.len) == self.head
    }

    pub fn write(&mut self, command: spec::Command) -> Result<(), QueueFull> {
        let next_tail = advance(self.tail, self.len);
        if next_tail == self.head {
            return Err(QueueFull);
        }
        self.mem
            .write_obj(self.tail as usize * size_of_val(&command), &command);
        self.tail = next_tail;
        Ok(())
    }

    /// Notifies the device of new entries.
    ///
    /// Unless `force` is set, the write is deferred until one more entry would
    /// make the tail catch up with the last notified tail, so that a batch of
    /// submissions costs a single doorbell. Returns true if the doorbell value
    /// was published.
    pub fn notify<T: DeviceBacking>(&mut self, registers: &DeviceRegisters<T>, force: bool) -> bool {
        if !force && advance(self.tail, self.len) != self.last_tail {
            return false;
        }
        if self
            .shadow
            .as_ref()
            .is_none_or(|shadow| shadow.update_and_check(self.tail))
        {
            fence(Ordering::Release);
            registers.doorbell(self.db_offset, self.tail);
        }
        self.last_tail = self.tail;
        true
    }

    /// Publishes any entries written since the last notification.
    pub fn commit<T: DeviceBacking>(&mut self, registers: &DeviceRegisters<T>) {
        if self.tail != self.last_tail {
            self.notify(registers, true);
        }
    }
}

pub(crate) struct CompletionQueue {
    cqid: u16,
    head: u32,
    committed_head: u32,
    len: u32,
    phase: bool,
    mem: MemoryBlock,
    db_offset: usize,
    shadow: Option<ShadowDoorbell>,
}

impl CompletionQueue {
    pub fn new(cqid: u16, len: u16, mem: MemoryBlock, db_offset: usize) -> CompletionQueue {
        Self {
            cqid,
            head: 0,
            committed_head: 0,
            len: len.into(),
            phase: true,
            mem,
            db_offset,
            shadow: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.cqid
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    /// Resets the indices and zeroes the ring for a newly created queue.
    pub fn reset(&mut self, db_offset: usize, shadow: Option<ShadowDoorbell>) {
        self.head = 0;
        self.committed_head = 0;
        self.phase = true;
        self.db_offset = db_offset;
        self.shadow = shadow;
        self.mem.fill_zero();
    }

    pub fn set_shadow(&mut self, shadow: Option<ShadowDoorbell>) {
        self.shadow = shadow;
    }

    pub fn read(&mut self) -> Option<spec::Completion> {
        let offset = self.head as usize * size_of::<spec::Completion>();
        // The status dword is checked first; the rest of the entry is only
        // valid once its phase matches.
        let dw3 = self.mem.read_u32(offset + 12);
        if (dw3 >> 16) & 1 != self.phase as u32 {
            return None;
        }
        fence(Ordering::Acquire);
        let completion = self.mem.read_obj::<spec::Completion>(offset);
        self.head += 1;
        if self.head == self.len {
            self.head = 0;
            self.phase = !self.phase;
        }
        Some(completion)
    }

    /// Writes the head doorbell if entries were consumed since the last call.
    pub fn commit<T: DeviceBacking>(&mut self, registers: &DeviceRegisters<T>) {
        if self.head != self.committed_head {
            if self
                .shadow
                .as_ref()
                .is_none_or(|shadow| shadow.update_and_check(self.head))
            {
                registers.doorbell(self.db_offset, self.head);
            }
            self.committed_head = self.head;
        }
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l {
        n + 1
    } else {
        0
    }
}
