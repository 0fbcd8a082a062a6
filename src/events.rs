//! The ACPI event subsystem: general-purpose events (GPEs), fixed-feature events, and the
//! sleep/wake and reset sequencing that is driven from the interpreter's namespace.
//!
//! An [`EventContext`] is built from the FADT. When the SCI fires, the host calls
//! [`EventContext::on_sci`]; pending events are acknowledged there and posted to the host's work
//! queue as [`PendingEvent`]s, which the host later feeds to [`EventContext::run_work`] on a
//! thread that is allowed to re-enter the interpreter (GPEs routed to `_Exx`/`_Lxx` methods
//! evaluate AML).

use crate::{
    namespace::{AmlName, NameSeg},
    object::Object,
    tables::{Fadt, GenericAddress},
    AmlError, Handler, Interpreter,
};
use alloc::{sync::Arc, vec, vec::Vec};
use core::str::FromStr;
use log::warn;
use spinning_top::Spinlock;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GpeTrigger {
    Edge,
    Level,
}

/// The fixed-feature events of the PM1 event register block. Discriminants are the bit positions
/// in the status/enable registers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum FixedEvent {
    Timer = 0,
    PowerButton = 8,
    SleepButton = 9,
    Rtc = 10,
}

impl FixedEvent {
    const ALL: [FixedEvent; 4] =
        [FixedEvent::Timer, FixedEvent::PowerButton, FixedEvent::SleepButton, FixedEvent::Rtc];

    fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

/// `WAK_STS`, in the PM1 status register.
const WAKE_STATUS_BIT: u64 = 1 << 15;
/// `SCI_EN`, in the PM1 control register.
const SCI_ENABLE_BIT: u64 = 1 << 0;
/// `SLP_TYPx` occupies bits 10..13 of the PM1 control register; `SLP_EN` is bit 13.
const SLP_TYP_SHIFT: u64 = 10;
const SLP_EN_BIT: u64 = 1 << 13;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SleepState {
    S1 = 1,
    S2,
    S3,
    S4,
    S5,
}

impl SleepState {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A piece of deferred event work, produced by [`EventContext::on_sci`] and handed to the host's
/// work queue. The host must eventually pass it to [`EventContext::run_work`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PendingEvent {
    Gpe { block: usize, index: u32 },
    Fixed { event: FixedEvent },
}

/// What to do when a GPE fires: call a native handler, or evaluate an AML method under `\_GPE`.
#[derive(Clone)]
pub enum GpeHandlerKind {
    Native(Arc<dyn Fn() + Send + Sync>),
    AmlMethod(AmlName),
}

/// One status/enable register pair of a GPE block. Each covers eight events; status registers
/// are write-one-to-clear.
#[derive(Clone, Copy, Debug)]
struct GpeRegister {
    status: GenericAddress,
    enable: GenericAddress,
}

impl GpeRegister {
    fn read_status<H: Handler>(&self, handler: &H) -> Result<u8, AmlError> {
        Ok(self.status.read(handler)? as u8)
    }

    fn clear_status<H: Handler>(&self, handler: &H, bit: u8) -> Result<(), AmlError> {
        self.status.write(handler, 1 << bit)
    }

    fn clear_all_status<H: Handler>(&self, handler: &H) -> Result<(), AmlError> {
        self.status.write(handler, 0xff)
    }

    fn enable_bit<H: Handler>(&self, handler: &H, bit: u8) -> Result<(), AmlError> {
        let value = self.enable.read(handler)?;
        self.enable.write(handler, value | (1 << bit))
    }

    fn disable_bit<H: Handler>(&self, handler: &H, bit: u8) -> Result<(), AmlError> {
        let value = self.enable.read(handler)?;
        self.enable.write(handler, value & !(1 << bit))
    }

    fn disable_all<H: Handler>(&self, handler: &H) -> Result<(), AmlError> {
        self.enable.write(handler, 0)
    }
}

struct GpeEvent {
    index: u32,
    trigger: GpeTrigger,
    kind: GpeHandlerKind,
    wake: bool,
}

struct GpeBlock {
    registers: Vec<GpeRegister>,
    /// Event indices in this block start here (nonzero only for block 1, from `GPE1_BASE`).
    base: u32,
    events: Vec<GpeEvent>,
}

impl GpeBlock {
    fn register_for(&self, index: u32) -> Option<(&GpeRegister, u8)> {
        if index < self.base {
            return None;
        }
        let relative = index - self.base;
        self.registers.get(relative as usize / 8).map(|reg| (reg, (relative % 8) as u8))
    }
}

struct Inner {
    gpe_blocks: [GpeBlock; 2],
    fixed_handlers: [Option<Arc<dyn Fn() + Send + Sync>>; 11],
    /// `SLP_TYPa`/`SLP_TYPb` for the state last prepared with `prepare_for_sleep_state`.
    slp_typ: Option<(u8, u8)>,
    /// The S0 values, captured before the first sleep so the working state can be restored.
    slp_typ_s0: Option<(u8, u8)>,
}

pub struct EventContext {
    inner: Spinlock<Inner>,
    sci_interrupt: u32,
    smi_cmd_port: u32,
    acpi_enable: u8,
    acpi_disable: u8,
    pm1a_status: Option<GenericAddress>,
    pm1a_enable: Option<GenericAddress>,
    pm1b_status: Option<GenericAddress>,
    pm1b_enable: Option<GenericAddress>,
    pm1a_control: Option<GenericAddress>,
    pm1b_control: Option<GenericAddress>,
    reset_register: Option<GenericAddress>,
    reset_value: u8,
    reset_supported: bool,
    fixed_power_button_supported: bool,
    fixed_sleep_button_supported: bool,
}

/// The PM1 event block is two halves: status in the low half, enable in the high half.
fn split_event_block(block: GenericAddress, byte_length: u8) -> (GenericAddress, GenericAddress) {
    let mut status = block;
    status.bit_width = block.bit_width / 2;
    let mut enable = status;
    enable.address += (byte_length / 2) as u64;
    (status, enable)
}

fn build_gpe_block<H>(
    handler: &H,
    address: Option<GenericAddress>,
    block_length: u8,
    base: u32,
) -> GpeBlock
where
    H: Handler,
{
    let mut registers = Vec::new();
    if let Some(address) = address {
        let register_count = (block_length / 2) as u64;
        for i in 0..register_count {
            let status = GenericAddress {
                space: address.space,
                bit_width: 8,
                bit_offset: 0,
                access_size: 1,
                address: address.address + i,
            };
            let enable = GenericAddress {
                space: address.space,
                bit_width: 8,
                bit_offset: 0,
                access_size: 1,
                address: address.address + register_count + i,
            };
            let register = GpeRegister { status, enable };

            // Start from a clean slate: everything disabled, nothing pending
            let _ = register.disable_all(handler);
            let _ = register.clear_all_status(handler);

            registers.push(register);
        }
    }
    GpeBlock { registers, base, events: Vec::new() }
}

impl EventContext {
    /// Build the event machinery from the FADT's register blocks, masking and clearing all GPEs
    /// and installing the SCI handler.
    pub fn new<H>(handler: &H, fadt: &Fadt) -> Result<EventContext, AmlError>
    where
        H: Handler,
    {
        let gpe0 = build_gpe_block(handler, fadt.gpe0_block, fadt.gpe0_block_length, 0);
        let gpe1 = build_gpe_block(handler, fadt.gpe1_block, fadt.gpe1_block_length, fadt.gpe1_base as u32);

        let (pm1a_status, pm1a_enable) = match fadt.pm1a_event_block {
            Some(block) => {
                let (status, enable) = split_event_block(block, fadt.pm1_event_length);
                (Some(status), Some(enable))
            }
            None => (None, None),
        };
        let (pm1b_status, pm1b_enable) = match fadt.pm1b_event_block {
            Some(block) => {
                let (status, enable) = split_event_block(block, fadt.pm1_event_length);
                (Some(status), Some(enable))
            }
            None => (None, None),
        };

        handler.install_sci_handler(fadt.sci_interrupt as u32);

        Ok(EventContext {
            inner: Spinlock::new(Inner {
                gpe_blocks: [gpe0, gpe1],
                fixed_handlers: Default::default(),
                slp_typ: None,
                slp_typ_s0: None,
            }),
            sci_interrupt: fadt.sci_interrupt as u32,
            smi_cmd_port: fadt.smi_cmd_port,
            acpi_enable: fadt.acpi_enable,
            acpi_disable: fadt.acpi_disable,
            pm1a_status,
            pm1a_enable,
            pm1b_status,
            pm1b_enable,
            pm1a_control: fadt.pm1a_control_block,
            pm1b_control: fadt.pm1b_control_block,
            reset_register: fadt.reset_register,
            reset_value: fadt.reset_value,
            reset_supported: fadt.supports_reset_register(),
            fixed_power_button_supported: fadt.supports_fixed_power_button(),
            fixed_sleep_button_supported: fadt.supports_fixed_sleep_button(),
        })
    }

    /// Mask every GPE and remove the SCI handler. Call before dropping the context.
    pub fn shutdown<H>(&self, handler: &H)
    where
        H: Handler,
    {
        let inner = self.inner.lock();
        for block in inner.gpe_blocks.iter() {
            for register in block.registers.iter() {
                let _ = register.disable_all(handler);
            }
        }
        handler.uninstall_sci_handler(self.sci_interrupt);
    }

    /// Route a GPE to a handler and set its enable bit. The trigger decides when the status bit
    /// is cleared: immediately for edge events, after the handler has run for level events.
    pub fn enable_gpe<H>(
        &self,
        handler: &H,
        index: u32,
        trigger: GpeTrigger,
        kind: GpeHandlerKind,
    ) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let mut inner = self.inner.lock();
        let block_index = self.block_index_for(&inner, index);
        let block = &mut inner.gpe_blocks[block_index];
        let Some((register, bit)) = block.register_for(index) else {
            return Err(AmlError::NoSuchGpe(index));
        };
        let register = *register;

        block.events.push(GpeEvent { index, trigger, kind, wake: false });
        if let Err(err) = register.enable_bit(handler, bit) {
            block.events.pop();
            return Err(err);
        }
        Ok(())
    }

    pub fn disable_gpe<H>(&self, handler: &H, index: u32) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let mut inner = self.inner.lock();
        let block_index = self.block_index_for(&inner, index);
        let block = &mut inner.gpe_blocks[block_index];
        let Some((register, bit)) = block.register_for(index) else {
            return Err(AmlError::NoSuchGpe(index));
        };
        register.disable_bit(handler, bit)?;
        block.events.retain(|event| event.index != index);
        Ok(())
    }

    /// Mark an enabled GPE as able to wake the system; only these stay armed across
    /// [`Self::enter_sleep_state`].
    pub fn mark_gpe_for_wake(&self, index: u32) -> Result<(), AmlError> {
        let mut inner = self.inner.lock();
        for block in inner.gpe_blocks.iter_mut() {
            for event in block.events.iter_mut() {
                if event.index == index {
                    event.wake = true;
                    return Ok(());
                }
            }
        }
        Err(AmlError::NoSuchGpe(index))
    }

    /// Wire up every `_Exx`/`_Lxx` method under `\_GPE`: `_E` methods are edge-triggered, `_L`
    /// level-triggered, and the two trailing characters are the hex event index.
    pub fn enable_events_from_namespace<H>(&self, interpreter: &Interpreter<H>) -> Result<usize, AmlError>
    where
        H: Handler,
    {
        let gpe_path = AmlName::from_str("\\_GPE").unwrap();
        let method_segs: Vec<NameSeg> = {
            let namespace = interpreter.namespace.lock();
            let mut found = Vec::new();
            namespace.traverse(|path, level| {
                if *path == gpe_path {
                    for (seg, (_, object)) in level.values.iter() {
                        if matches!(**object, Object::Method { .. }) {
                            found.push(*seg);
                        }
                    }
                }
                Ok(true)
            })?;
            found
        };

        let mut enabled = 0;
        for seg in method_segs {
            let name = seg.as_str();
            let bytes = name.as_bytes();
            if bytes[0] != b'_' {
                continue;
            }
            let trigger = match bytes[1] {
                b'E' => GpeTrigger::Edge,
                b'L' => GpeTrigger::Level,
                _ => continue,
            };
            let Some(index) = parse_hex_pair(bytes[2], bytes[3]) else { continue };

            let method_path = AmlName::from_str(name).unwrap().resolve(&gpe_path)?;
            match self.enable_gpe(
                interpreter.handler(),
                index as u32,
                trigger,
                GpeHandlerKind::AmlMethod(method_path),
            ) {
                Ok(()) => enabled += 1,
                Err(err) => warn!("Failed to enable GPE method \\_GPE.{}: {:?}", name, err),
            }
        }
        Ok(enabled)
    }

    pub fn enable_fixed_event<H>(
        &self,
        handler: &H,
        event: FixedEvent,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<(), AmlError>
    where
        H: Handler,
    {
        if (event == FixedEvent::PowerButton && !self.fixed_power_button_supported)
            || (event == FixedEvent::SleepButton && !self.fixed_sleep_button_supported)
        {
            return Err(AmlError::FixedEventNotSupported);
        }

        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.fixed_handlers[event as usize];
            if slot.is_some() {
                return Err(AmlError::EventHandlerAlreadyInstalled);
            }
            *slot = Some(callback);
        }

        self.set_fixed_event_enable(handler, event, true)
    }

    pub fn disable_fixed_event<H>(&self, handler: &H, event: FixedEvent) -> Result<(), AmlError>
    where
        H: Handler,
    {
        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.fixed_handlers[event as usize];
            if slot.is_none() {
                return Err(AmlError::FixedEventNotSupported);
            }
            *slot = None;
        }
        self.set_fixed_event_enable(handler, event, false)
    }

    /// Both PM1 enable registers see the same mask.
    fn set_fixed_event_enable<H>(&self, handler: &H, event: FixedEvent, enable: bool) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let mut value = match self.pm1a_enable {
            Some(register) => register.read(handler)?,
            None => return Err(AmlError::FixedEventNotSupported),
        };
        if let Some(register) = self.pm1b_enable {
            value |= register.read(handler)?;
        }

        if enable {
            value |= event.bit();
        } else {
            value &= !event.bit();
        }

        if let Some(register) = self.pm1a_enable {
            register.write(handler, value)?;
        }
        if let Some(register) = self.pm1b_enable {
            register.write(handler, value)?;
        }
        Ok(())
    }

    fn read_pm1_status<H>(&self, handler: &H) -> Result<u64, AmlError>
    where
        H: Handler,
    {
        let mut value = match self.pm1a_status {
            Some(register) => register.read(handler)?,
            None => return Ok(0),
        };
        if let Some(register) = self.pm1b_status {
            value |= register.read(handler)?;
        }
        Ok(value)
    }

    fn write_pm1_status<H>(&self, handler: &H, value: u64) -> Result<(), AmlError>
    where
        H: Handler,
    {
        if let Some(register) = self.pm1a_status {
            register.write(handler, value)?;
        }
        if let Some(register) = self.pm1b_status {
            register.write(handler, value)?;
        }
        Ok(())
    }

    /// The host's SCI interrupt handler calls this. Pending events are acknowledged and posted
    /// to the host work queue; returns whether the interrupt was ours.
    pub fn on_sci<H>(&self, handler: &H) -> bool
    where
        H: Handler,
    {
        if self.check_fixed_events(handler) {
            return true;
        }
        self.check_gpe_events(handler)
    }

    fn check_fixed_events<H>(&self, handler: &H) -> bool
    where
        H: Handler,
    {
        let Ok(status) = self.read_pm1_status(handler) else { return false };

        let interesting: u64 = FixedEvent::ALL.iter().map(|event| event.bit()).sum();
        let pending = status & interesting;
        if pending == 0 {
            return false;
        }

        {
            let inner = self.inner.lock();
            for event in FixedEvent::ALL {
                if pending & event.bit() != 0 && inner.fixed_handlers[event as usize].is_some() {
                    if !handler.queue_work(PendingEvent::Fixed { event }) {
                        warn!("Host failed to queue fixed-event work for {:?}", event);
                    }
                }
            }
        }

        // Status bits are write-one-to-clear
        let _ = self.write_pm1_status(handler, pending);
        true
    }

    fn check_gpe_events<H>(&self, handler: &H) -> bool
    where
        H: Handler,
    {
        let inner = self.inner.lock();
        for (block_index, block) in inner.gpe_blocks.iter().enumerate() {
            for event in block.events.iter() {
                let Some((register, bit)) = block.register_for(event.index) else { continue };
                let Ok(status) = register.read_status(handler) else { continue };
                if status & (1 << bit) == 0 {
                    continue;
                }

                /*
                 * Disable the event until its handler has run, so a level-triggered source
                 * can't re-raise the SCI underneath us; edge-triggered sources can be
                 * acknowledged immediately.
                 */
                if register.disable_bit(handler, bit).is_err() {
                    continue;
                }
                if event.trigger == GpeTrigger::Edge {
                    let _ = register.clear_status(handler, bit);
                }

                if !handler.queue_work(PendingEvent::Gpe { block: block_index, index: event.index }) {
                    warn!("Host failed to queue GPE work for event {}", event.index);
                }
                return true;
            }
        }
        false
    }

    /// Execute a piece of work queued by [`Self::on_sci`] - run the handler or evaluate the
    /// routed AML method, then (for level triggers) clear the status bit, and re-arm the event.
    pub fn run_work<H>(&self, interpreter: &Interpreter<H>, work: PendingEvent) -> Result<(), AmlError>
    where
        H: Handler,
    {
        match work {
            PendingEvent::Fixed { event } => {
                let callback = {
                    let inner = self.inner.lock();
                    inner.fixed_handlers[event as usize].clone()
                };
                match callback {
                    Some(callback) => {
                        callback();
                        Ok(())
                    }
                    None => Err(AmlError::FixedEventNotSupported),
                }
            }
            PendingEvent::Gpe { block, index } => {
                let (register, bit, trigger, kind) = {
                    let inner = self.inner.lock();
                    let block = &inner.gpe_blocks[block];
                    let Some(event) = block.events.iter().find(|event| event.index == index) else {
                        return Err(AmlError::NoSuchGpe(index));
                    };
                    let Some((register, bit)) = block.register_for(index) else {
                        return Err(AmlError::NoSuchGpe(index));
                    };
                    (*register, bit, event.trigger, event.kind.clone())
                };

                match kind {
                    GpeHandlerKind::Native(callback) => callback(),
                    GpeHandlerKind::AmlMethod(path) => {
                        if let Err(err) = interpreter.evaluate(path.clone(), vec![]) {
                            warn!("GPE method {} failed: {:?}", path, err);
                        }
                    }
                }

                if trigger == GpeTrigger::Level {
                    let _ = register.clear_status(interpreter.handler(), bit);
                }
                register.enable_bit(interpreter.handler(), bit)
            }
        }
    }

    /// Write the enable command to the SMI command port and wait (up to ~2s) for the hardware to
    /// hand over, indicated by `SCI_EN` in the PM1 control register.
    pub fn enable_acpi_mode<H>(&self, handler: &H, enable: bool) -> Result<(), AmlError>
    where
        H: Handler,
    {
        if self.smi_cmd_port == 0 {
            // Hardware-reduced or already in ACPI mode; nothing to hand over
            return Ok(());
        }

        let command = if enable { self.acpi_enable } else { self.acpi_disable };
        handler.write_io_u8(self.smi_cmd_port as u16, command);

        const ENABLE_TIMEOUT_NANOS: u64 = 2_000_000_000;
        let start = handler.nanos_since_boot();
        loop {
            let sci_enabled = self.read_pm1_control(handler)? & SCI_ENABLE_BIT != 0;
            if sci_enabled == enable {
                return Ok(());
            }
            if handler.nanos_since_boot().wrapping_sub(start) > ENABLE_TIMEOUT_NANOS {
                return Err(AmlError::Timeout);
            }
            handler.stall(100);
        }
    }

    fn read_pm1_control<H>(&self, handler: &H) -> Result<u64, AmlError>
    where
        H: Handler,
    {
        let mut value = match self.pm1a_control {
            Some(register) => register.read(handler)?,
            None => return Ok(0),
        };
        if let Some(register) = self.pm1b_control {
            value |= register.read(handler)?;
        }
        Ok(value)
    }

    /// Evaluate `\_PTS` and read `\_Sx` to find the `SLP_TYP` values for `state`. The S0 values
    /// are captured on first use so [`Self::wake_from_state`] can restore the working state.
    pub fn prepare_for_sleep_state<H>(
        &self,
        interpreter: &Interpreter<H>,
        state: SleepState,
    ) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let s0_captured = self.inner.lock().slp_typ_s0.is_some();
        if !s0_captured {
            if let Ok(Some(typ)) = self.read_sleep_typ(interpreter, 0) {
                self.inner.lock().slp_typ_s0 = Some(typ);
            }
        }

        interpreter.evaluate_if_present(
            AmlName::from_str("\\_PTS").unwrap(),
            vec![Object::Integer(state.as_u8() as u64).wrap()],
        )?;

        let Some(typ) = self.read_sleep_typ(interpreter, state.as_u8())? else {
            return Err(AmlError::SleepStateUnsupported(state.as_u8()));
        };
        self.inner.lock().slp_typ = Some(typ);
        Ok(())
    }

    /// Read the `(SLP_TYPa, SLP_TYPb)` pair from a `\_Sx` package, if the firmware defines one.
    fn read_sleep_typ<H>(
        &self,
        interpreter: &Interpreter<H>,
        state: u8,
    ) -> Result<Option<(u8, u8)>, AmlError>
    where
        H: Handler,
    {
        let path = AmlName::from_str(&alloc::format!("\\_S{}", state)).unwrap();
        let Some(package) = interpreter.evaluate_if_present(path, vec![])? else {
            return Ok(None);
        };

        let typ_a = interpreter.get_pkg_element(&package, 0)?;
        let typ_b = interpreter.get_pkg_element(&package, 1)?;
        Ok(Some((
            interpreter.object_to_integer(&typ_a, 8)? as u8,
            interpreter.object_to_integer(&typ_b, 8)? as u8,
        )))
    }

    /// Put the platform into the prepared sleep state: clear `WAK_STS`, quiesce all GPEs,
    /// re-arm only wake-capable ones, then write `SLP_TYP` followed by `SLP_TYP | SLP_EN` into
    /// the PM1 control registers. For S4 and deeper, execution continuing past ~10s is reported
    /// as a timeout.
    pub fn enter_sleep_state<H>(&self, handler: &H, state: SleepState) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let (typ_a, typ_b) = {
            let inner = self.inner.lock();
            inner.slp_typ.ok_or(AmlError::SleepStateUnsupported(state.as_u8()))?
        };

        self.write_pm1_status(handler, WAKE_STATUS_BIT)?;

        {
            let inner = self.inner.lock();
            for block in inner.gpe_blocks.iter() {
                for register in block.registers.iter() {
                    let _ = register.disable_all(handler);
                    let _ = register.clear_all_status(handler);
                }
                for event in block.events.iter() {
                    if event.wake {
                        if let Some((register, bit)) = block.register_for(event.index) {
                            let _ = register.enable_bit(handler, bit);
                        }
                    }
                }
            }
        }

        self.write_slp_typ(handler, typ_a, typ_b, false)?;
        self.write_slp_typ(handler, typ_a, typ_b, true)?;

        if state as u8 >= SleepState::S4 as u8 {
            const SLEEP_TIMEOUT_NANOS: u64 = 10_000_000_000;
            let start = handler.nanos_since_boot();
            loop {
                if self.read_pm1_status(handler)? & WAKE_STATUS_BIT != 0 {
                    break;
                }
                if handler.nanos_since_boot().wrapping_sub(start) > SLEEP_TIMEOUT_NANOS {
                    return Err(AmlError::Timeout);
                }
                handler.stall(1000);
            }
        }

        Ok(())
    }

    fn write_slp_typ<H>(&self, handler: &H, typ_a: u8, typ_b: u8, slp_en: bool) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let enable = if slp_en { SLP_EN_BIT } else { 0 };
        if let Some(register) = self.pm1a_control {
            let value = register.read(handler)? & !(0b111 << SLP_TYP_SHIFT) & !SLP_EN_BIT;
            register.write(handler, value | ((typ_a as u64 & 0b111) << SLP_TYP_SHIFT) | enable)?;
        }
        if let Some(register) = self.pm1b_control {
            let value = register.read(handler)? & !(0b111 << SLP_TYP_SHIFT) & !SLP_EN_BIT;
            register.write(handler, value | ((typ_b as u64 & 0b111) << SLP_TYP_SHIFT) | enable)?;
        }
        Ok(())
    }

    /// Undo [`Self::enter_sleep_state`] after the platform resumes: restore the S0 `SLP_TYP`
    /// values, re-arm runtime GPEs, and run `\_WAK` and `\_SI._SST(1)`.
    pub fn wake_from_state<H>(&self, interpreter: &Interpreter<H>, state: SleepState) -> Result<(), AmlError>
    where
        H: Handler,
    {
        let handler = interpreter.handler();

        let s0 = self.inner.lock().slp_typ_s0;
        if let Some((typ_a, typ_b)) = s0 {
            self.write_slp_typ(handler, typ_a, typ_b, false)?;
        }

        {
            let inner = self.inner.lock();
            for block in inner.gpe_blocks.iter() {
                for event in block.events.iter() {
                    if let Some((register, bit)) = block.register_for(event.index) {
                        let _ = register.enable_bit(handler, bit);
                    }
                }
            }
        }

        interpreter.evaluate_if_present(
            AmlName::from_str("\\_WAK").unwrap(),
            vec![Object::Integer(state.as_u8() as u64).wrap()],
        )?;

        // Tell the firmware we're back in the working state
        const SST_WORKING: u64 = 1;
        interpreter.evaluate_if_present(
            AmlName::from_str("\\_SI._SST").unwrap(),
            vec![Object::Integer(SST_WORKING).wrap()],
        )?;

        Ok(())
    }

    /// Reset the platform through the FADT's reset register. Gated on the FADT advertising
    /// support (flag bit 10).
    pub fn reset<H>(&self, handler: &H) -> Result<(), AmlError>
    where
        H: Handler,
    {
        if !self.reset_supported {
            return Err(AmlError::ResetNotSupported);
        }
        let register = self.reset_register.ok_or(AmlError::ResetNotSupported)?;

        match register.space {
            crate::RegionSpace::PciConfig => {
                // The address encodes device/function/offset on segment 0, bus 0
                let device = (register.address >> 32) as u8;
                let function = (register.address >> 16) as u8;
                let offset = register.address as u16;
                let address = pci_types::PciAddress::new(0, 0, device, function);
                handler.write_pci_u8(address, offset, self.reset_value);
                Ok(())
            }
            _ => register.write(handler, self.reset_value as u64),
        }
    }

    fn block_index_for(&self, inner: &Inner, index: u32) -> usize {
        let block1 = &inner.gpe_blocks[1];
        if !block1.registers.is_empty() && index >= block1.base {
            1
        } else {
            0
        }
    }
}

fn parse_hex_pair(high: u8, low: u8) -> Option<u8> {
    fn digit(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    Some(digit(high)? * 16 + digit(low)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{build_fadt, method, namestring, pkg, TestHandler};
    use crate::Interpreter;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /*
     * FADT byte offsets used to build test tables: sci_int = 46, smi_cmd = 48, acpi_enable = 52,
     * pm1a_evt_blk = 56, pm1a_cnt_blk = 64, gpe0_blk = 80, pm1_evt_len = 88, pm1_cnt_len = 89,
     * gpe0_blk_len = 92, flags = 112, reset_reg = 116, reset_value = 128.
     */
    fn test_fadt() -> Fadt {
        let data = build_fadt(|data| {
            data[46..48].copy_from_slice(&9u16.to_le_bytes());
            data[48..52].copy_from_slice(&0xb2u32.to_le_bytes());
            data[52] = 0xa0;
            data[56..60].copy_from_slice(&0x600u32.to_le_bytes());
            data[64..68].copy_from_slice(&0x604u32.to_le_bytes());
            data[80..84].copy_from_slice(&0x620u32.to_le_bytes());
            data[88] = 4;
            data[89] = 2;
            data[92] = 4;
            // Reset register supported: system I/O port 0xcf9, value 6
            data[112..116].copy_from_slice(&(1u32 << 10).to_le_bytes());
            data[116] = 1;
            data[117] = 8;
            data[119] = 1;
            data[120..128].copy_from_slice(&0xcf9u64.to_le_bytes());
            data[128] = 6;
        });
        Fadt::parse(&data).unwrap()
    }

    fn make_interpreter() -> Interpreter<TestHandler> {
        Interpreter::new(TestHandler::new(), 2)
    }

    fn name(path: &str) -> AmlName {
        AmlName::from_str(path).unwrap()
    }

    #[test]
    fn init_masks_gpes_and_installs_sci() {
        let interpreter = make_interpreter();
        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();

        assert_eq!(&*interpreter.handler().sci_installed.lock(), &[9]);
        // Both GPE0 enable registers (0x622, 0x623) were masked
        let writes = interpreter.handler().io_writes.lock();
        assert!(writes.contains(&(0x622, 0, 1)));
        assert!(writes.contains(&(0x623, 0, 1)));
        drop(writes);

        events.shutdown(interpreter.handler());
        assert!(interpreter.handler().sci_installed.lock().is_empty());
    }

    #[test]
    fn gpe_method_dispatch() {
        let interpreter = make_interpreter();

        // \GFLG plus Scope(\_GPE) { Method(_E01) { Store(1, \GFLG) } }
        let mut table = alloc::vec![0x08];
        table.extend(namestring("GFLG"));
        table.push(0x00);
        let mut scope = namestring("\\_GPE");
        let mut body = alloc::vec![0x70, 0x01];
        body.extend(namestring("\\GFLG"));
        scope.extend(method("_E01", 0, &body));
        table.push(0x10);
        table.extend(pkg(&scope));
        interpreter.load_table(&table).unwrap();

        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();
        assert_eq!(events.enable_events_from_namespace(&interpreter).unwrap(), 1);
        // Enable bit 1 of the first GPE0 register
        assert_eq!(interpreter.handler().get_io(0x622) & 0x02, 0x02);

        // Raise the event's status bit and take the SCI
        interpreter.handler().set_io(0x620, 0x02);
        assert!(events.on_sci(interpreter.handler()));

        let work = interpreter.handler().queued_work.lock().pop().unwrap();
        assert_eq!(work, PendingEvent::Gpe { block: 0, index: 1 });
        // The event was masked while its work is pending, and (being edge-triggered) acked
        assert_eq!(interpreter.handler().get_io(0x622) & 0x02, 0x00);

        events.run_work(&interpreter, work).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\GFLG"), alloc::vec![]), Ok(1));
        // Re-armed after the handler ran
        assert_eq!(interpreter.handler().get_io(0x622) & 0x02, 0x02);
    }

    #[test]
    fn fixed_event_dispatch() {
        let interpreter = make_interpreter();
        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();

        let presses = Arc::new(AtomicUsize::new(0));
        let counter = presses.clone();
        events
            .enable_fixed_event(
                interpreter.handler(),
                FixedEvent::PowerButton,
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // The enable mask reached both halves of the enable register (bit 8 = 0x603... bit 0 of
        // the second byte at 0x603)
        assert_eq!(interpreter.handler().get_io(0x603), 0x01);

        // Power button status is bit 8 of the status register at 0x600
        interpreter.handler().set_io(0x601, 0x01);
        assert!(events.on_sci(interpreter.handler()));

        let work = interpreter.handler().queued_work.lock().pop().unwrap();
        assert_eq!(work, PendingEvent::Fixed { event: FixedEvent::PowerButton });
        events.run_work(&interpreter, work).unwrap();
        assert_eq!(presses.load(Ordering::SeqCst), 1);

        // The status bit was cleared by writing it back
        let writes = interpreter.handler().io_writes.lock();
        assert!(writes.iter().any(|&(port, value, _)| port == 0x600 && value & (1 << 8) != 0));
    }

    #[test]
    fn sleep_sequence() {
        let interpreter = make_interpreter();

        // Name(STAT, 0); Name(_S3, Package { 5, 0 }); _PTS/_WAK store their argument to \STAT
        let mut table = alloc::vec![0x08];
        table.extend(namestring("STAT"));
        table.push(0x00);
        table.push(0x08);
        table.extend(namestring("_S3"));
        table.push(0x12);
        table.extend(pkg(&[0x02, 0x0a, 0x05, 0x00]));
        let mut store_arg = alloc::vec![0x70, 0x68];
        store_arg.extend(namestring("\\STAT"));
        table.extend(method("_PTS", 1, &store_arg));
        table.extend(method("_WAK", 1, &store_arg));
        interpreter.load_table(&table).unwrap();

        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();
        events.prepare_for_sleep_state(&interpreter, SleepState::S3).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\STAT"), alloc::vec![]), Ok(3));

        interpreter.handler().io_writes.lock().clear();
        events.enter_sleep_state(interpreter.handler(), SleepState::S3).unwrap();

        let writes: Vec<(u16, u64, usize)> = interpreter.handler().io_writes.lock().clone();
        // Wake status cleared first
        assert!(writes.iter().any(|&(port, value, _)| port == 0x600 && value == WAKE_STATUS_BIT));
        // SLP_TYPa written to PM1a control, then SLP_EN set with it
        let control_writes: Vec<u64> =
            writes.iter().filter(|&&(port, _, _)| port == 0x604).map(|&(_, value, _)| value).collect();
        assert_eq!(control_writes, alloc::vec![5 << SLP_TYP_SHIFT, (5 << SLP_TYP_SHIFT) | SLP_EN_BIT]);

        // Waking runs \_WAK with the state we left
        interpreter.evaluate(name("\\_PTS"), alloc::vec![Object::Integer(0).wrap()]).unwrap();
        events.wake_from_state(&interpreter, SleepState::S3).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\STAT"), alloc::vec![]), Ok(3));
    }

    #[test]
    fn missing_sleep_state_is_reported() {
        let interpreter = make_interpreter();
        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();
        assert_eq!(
            events.prepare_for_sleep_state(&interpreter, SleepState::S1),
            Err(AmlError::SleepStateUnsupported(1))
        );
    }

    #[test]
    fn acpi_mode_enable() {
        let interpreter = make_interpreter();
        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();

        // Pretend SCI_EN comes up immediately after the SMI command
        interpreter.handler().set_io(0x604, 0x01);
        events.enable_acpi_mode(interpreter.handler(), true).unwrap();
        assert!(interpreter.handler().io_writes.lock().contains(&(0xb2, 0xa0, 1)));
    }

    #[test]
    fn reset_writes_reset_register() {
        let interpreter = make_interpreter();
        let events = EventContext::new(interpreter.handler(), &test_fadt()).unwrap();
        events.reset(interpreter.handler()).unwrap();
        assert!(interpreter.handler().io_writes.lock().contains(&(0xcf9, 6, 1)));
    }
}
