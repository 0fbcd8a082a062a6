//! Shared scaffolding for the crate's tests: a [`Handler`] backed by in-memory register files,
//! and small builders for hand-assembled AML byte streams and tables.

use crate::{events::PendingEvent, AmlError, Handle, Handler};
use alloc::{collections::btree_map::BTreeMap, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use pci_types::PciAddress;
use spinning_top::Spinlock;

pub(crate) struct TestHandler {
    memory: Spinlock<BTreeMap<usize, u8>>,
    io: Spinlock<BTreeMap<u16, u8>>,
    /// Every port write, as `(port, value, width)`, in order.
    pub io_writes: Spinlock<Vec<(u16, u64, usize)>>,
    mutexes: Spinlock<BTreeMap<Handle, bool>>,
    events: Spinlock<BTreeMap<Handle, bool>>,
    next_handle: AtomicU32,
    now: AtomicU64,
    pub queued_work: Spinlock<Vec<PendingEvent>>,
    pub sci_installed: Spinlock<Vec<u32>>,
}

impl TestHandler {
    pub fn new() -> TestHandler {
        TestHandler {
            memory: Spinlock::new(BTreeMap::new()),
            io: Spinlock::new(BTreeMap::new()),
            io_writes: Spinlock::new(Vec::new()),
            mutexes: Spinlock::new(BTreeMap::new()),
            events: Spinlock::new(BTreeMap::new()),
            next_handle: AtomicU32::new(0),
            now: AtomicU64::new(0),
            queued_work: Spinlock::new(Vec::new()),
            sci_installed: Spinlock::new(Vec::new()),
        }
    }

    fn memory_read(&self, address: usize, width: usize) -> u64 {
        let memory = self.memory.lock();
        let mut value = 0;
        for i in 0..width {
            value |= (*memory.get(&(address + i)).unwrap_or(&0) as u64) << (i * 8);
        }
        value
    }

    fn memory_write(&self, address: usize, width: usize, value: u64) {
        let mut memory = self.memory.lock();
        for i in 0..width {
            memory.insert(address + i, (value >> (i * 8)) as u8);
        }
    }

    fn io_read(&self, port: u16, width: usize) -> u64 {
        let io = self.io.lock();
        let mut value = 0;
        for i in 0..width {
            value |= (*io.get(&(port + i as u16)).unwrap_or(&0) as u64) << (i * 8);
        }
        value
    }

    fn io_write(&self, port: u16, width: usize, value: u64) {
        {
            let mut io = self.io.lock();
            for i in 0..width {
                io.insert(port + i as u16, (value >> (i * 8)) as u8);
            }
        }
        self.io_writes.lock().push((port, value, width));
    }

    pub fn set_io(&self, port: u16, value: u8) {
        self.io.lock().insert(port, value);
    }

    pub fn get_io(&self, port: u16) -> u8 {
        *self.io.lock().get(&port).unwrap_or(&0)
    }

    fn new_handle(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }
}

impl Handler for TestHandler {
    fn read_u8(&self, address: usize) -> u8 {
        self.memory_read(address, 1) as u8
    }
    fn read_u16(&self, address: usize) -> u16 {
        self.memory_read(address, 2) as u16
    }
    fn read_u32(&self, address: usize) -> u32 {
        self.memory_read(address, 4) as u32
    }
    fn read_u64(&self, address: usize) -> u64 {
        self.memory_read(address, 8)
    }

    fn write_u8(&self, address: usize, value: u8) {
        self.memory_write(address, 1, value as u64)
    }
    fn write_u16(&self, address: usize, value: u16) {
        self.memory_write(address, 2, value as u64)
    }
    fn write_u32(&self, address: usize, value: u32) {
        self.memory_write(address, 4, value as u64)
    }
    fn write_u64(&self, address: usize, value: u64) {
        self.memory_write(address, 8, value)
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        self.io_read(port, 1) as u8
    }
    fn read_io_u16(&self, port: u16) -> u16 {
        self.io_read(port, 2) as u16
    }
    fn read_io_u32(&self, port: u16) -> u32 {
        self.io_read(port, 4) as u32
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        self.io_write(port, 1, value as u64)
    }
    fn write_io_u16(&self, port: u16, value: u16) {
        self.io_write(port, 2, value as u64)
    }
    fn write_io_u32(&self, port: u16, value: u32) {
        self.io_write(port, 4, value as u64)
    }

    fn read_pci_u8(&self, _address: PciAddress, _offset: u16) -> u8 {
        0
    }
    fn read_pci_u16(&self, _address: PciAddress, _offset: u16) -> u16 {
        0
    }
    fn read_pci_u32(&self, _address: PciAddress, _offset: u16) -> u32 {
        0
    }

    fn write_pci_u8(&self, _address: PciAddress, _offset: u16, _value: u8) {}
    fn write_pci_u16(&self, _address: PciAddress, _offset: u16, _value: u16) {}
    fn write_pci_u32(&self, _address: PciAddress, _offset: u16, _value: u32) {}

    fn nanos_since_boot(&self) -> u64 {
        // Each observation advances time by a millisecond, so polling loops terminate
        self.now.fetch_add(1_000_000, Ordering::SeqCst)
    }

    fn stall(&self, _microseconds: u64) {}
    fn sleep(&self, _milliseconds: u64) {}

    fn create_mutex(&self) -> Handle {
        let handle = self.new_handle();
        self.mutexes.lock().insert(handle, false);
        handle
    }

    fn acquire(&self, mutex: Handle, timeout: u16) -> Result<(), AmlError> {
        let mut mutexes = self.mutexes.lock();
        let locked = mutexes.get_mut(&mutex).expect("acquire of unknown mutex");
        if *locked {
            if timeout == 0xffff {
                panic!("test deadlock: infinite wait on a locked mutex");
            }
            return Err(AmlError::Timeout);
        }
        *locked = true;
        Ok(())
    }

    fn release(&self, mutex: Handle) {
        let mut mutexes = self.mutexes.lock();
        let locked = mutexes.get_mut(&mutex).expect("release of unknown mutex");
        assert!(*locked, "release of unlocked mutex");
        *locked = false;
    }

    fn create_event(&self) -> Handle {
        let handle = self.new_handle();
        self.events.lock().insert(handle, false);
        handle
    }

    fn signal_event(&self, event: Handle) {
        self.events.lock().insert(event, true);
    }

    fn wait_for_event(&self, event: Handle, timeout: u16) -> Result<(), AmlError> {
        let mut events = self.events.lock();
        let signalled = events.get_mut(&event).expect("wait on unknown event");
        if *signalled {
            *signalled = false;
            Ok(())
        } else {
            if timeout == 0xffff {
                panic!("test deadlock: infinite wait on an unsignalled event");
            }
            Err(AmlError::Timeout)
        }
    }

    fn reset_event(&self, event: Handle) {
        self.events.lock().insert(event, false);
    }

    fn thread_id(&self) -> u64 {
        1
    }

    fn install_sci_handler(&self, irq: u32) {
        self.sci_installed.lock().push(irq);
    }

    fn uninstall_sci_handler(&self, irq: u32) {
        self.sci_installed.lock().retain(|&installed| installed != irq);
    }

    fn queue_work(&self, work: PendingEvent) -> bool {
        self.queued_work.lock().push(work);
        true
    }
}

/// Encode a PkgLength (which includes its own bytes) in front of `content`.
pub(crate) fn pkg(content: &[u8]) -> Vec<u8> {
    let total = content.len() + 1;
    let mut out = if total <= 0x3f {
        vec![total as u8]
    } else {
        let total = content.len() + 2;
        assert!(total < (1 << 12));
        vec![0x40 | (total & 0xf) as u8, (total >> 4) as u8]
    };
    out.extend_from_slice(content);
    out
}

/// Encode a namestring: optional `\`/`^` prefixes, then null/single/dual/multi name paths, with
/// segments padded to four characters with underscores.
pub(crate) fn namestring(name: &str) -> Vec<u8> {
    fn push_seg(out: &mut Vec<u8>, seg: &str) {
        assert!(!seg.is_empty() && seg.len() <= 4);
        let mut bytes = [b'_'; 4];
        bytes[0..seg.len()].copy_from_slice(seg.as_bytes());
        out.extend_from_slice(&bytes);
    }

    let mut out = Vec::new();
    let mut name = name;
    if let Some(rest) = name.strip_prefix('\\') {
        out.push(b'\\');
        name = rest;
    }
    while let Some(rest) = name.strip_prefix('^') {
        out.push(b'^');
        name = rest;
    }

    let segs: Vec<&str> = if name.is_empty() { Vec::new() } else { name.split('.').collect() };
    match segs.len() {
        0 => out.push(0x00),
        1 => push_seg(&mut out, segs[0]),
        2 => {
            out.push(0x2e);
            push_seg(&mut out, segs[0]);
            push_seg(&mut out, segs[1]);
        }
        count => {
            out.push(0x2f);
            out.push(count as u8);
            for seg in segs {
                push_seg(&mut out, seg);
            }
        }
    }
    out
}

/// Encode `Method(name, flags) { body }`.
pub(crate) fn method(name: &str, flags: u8, body: &[u8]) -> Vec<u8> {
    let mut content = namestring(name);
    content.push(flags);
    content.extend_from_slice(body);
    let mut out = vec![0x14];
    out.extend(pkg(&content));
    out
}

/// Build a table image with a valid SDT header and checksum around `body`.
pub(crate) fn build_sdt(signature: &[u8; 4], revision: u8, body: &[u8]) -> Vec<u8> {
    let length = crate::tables::SDT_HEADER_LENGTH + body.len();
    let mut data = vec![0u8; length];
    data[0..4].copy_from_slice(signature);
    data[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    data[8] = revision;
    data[10..16].copy_from_slice(b"QTZOEM");
    data[16..24].copy_from_slice(b"QTZTBLID");
    data[crate::tables::SDT_HEADER_LENGTH..].copy_from_slice(body);

    let sum = data.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte));
    data[9] = data[9].wrapping_sub(sum);
    data
}

/// Build a minimal `FACP` image (all fields zero), let the caller poke registers in, then fix up
/// the checksum.
pub(crate) fn build_fadt<F>(customize: F) -> Vec<u8>
where
    F: FnOnce(&mut [u8]),
{
    let mut data = vec![0u8; 276];
    data[0..4].copy_from_slice(b"FACP");
    data[4..8].copy_from_slice(&276u32.to_le_bytes());
    data[8] = 6;
    customize(&mut data);

    data[9] = 0;
    let sum = data.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte));
    data[9] = 0u8.wrapping_sub(sum);
    data
}
