//! A freestanding interpreter for AML, the bytecode that platform firmware embeds in the DSDT
//! and SSDTs, plus the ACPI fixed-feature and general-purpose event machinery that is driven from
//! the resulting namespace. The crate is meant to be embedded in a kernel or hypervisor: the host
//! supplies a [`Handler`] for memory, port, and PCI access, time, and synchronisation primitives,
//! and gets back a populated namespace it can evaluate methods against.

#![no_std]

extern crate alloc;

pub mod eisa;
pub mod events;
pub mod namespace;
pub mod object;
pub mod op_region;
pub mod tables;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use eisa::EisaId;
pub use object::{Object, ObjectType};
pub use op_region::{OpRegion, RegionHandler, RegionSpace};

use alloc::{
    boxed::Box,
    collections::btree_map::BTreeMap,
    format,
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use bit_field::BitField;
use core::{mem, str::FromStr};
use log::{info, trace, warn};
use namespace::{AmlName, Namespace, NamespaceLevelKind};
use object::{FieldFlags, FieldUnit, FieldUnitKind, FieldUpdateRule, MethodFlags, ReferenceKind};
use op_region::OpRegion as Region;
use pci_types::PciAddress;
use spinning_top::Spinlock;
use tables::SdtHeader;

/// The value returned by the `Revision` opcode.
const INTERPRETER_REVISION: u64 = 1;

/// An opaque token for a host-allocated object (a mutex or an event). Hosts hand these out from
/// [`Handler::create_mutex`] / [`Handler::create_event`] and get them back in the corresponding
/// lock/signal calls. They are compared by equality and never interpreted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Handle(pub u32);

/// A function installed with [`Interpreter::install_notify_handler`], invoked when AML executes
/// `Notify` on the watched object, or when the host forwards a notification via
/// [`Interpreter::on_notify`].
pub type NotifyHandler = Box<dyn Fn(&AmlName, u64) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IterDecision {
    Continue,
    Break,
}

/// An id to match devices against in [`Interpreter::discover_nodes`]. `_HID`/`_CID` objects can
/// be strings or compressed EISA integers; both compare against either form here.
#[derive(Clone, Copy, Debug)]
pub enum DeviceId<'a> {
    Eisa(EisaId),
    Str(&'a str),
}

pub struct Interpreter<H>
where
    H: Handler,
{
    pub(crate) handler: H,
    pub namespace: Spinlock<Namespace>,
    dsdt_revision: u8,
    region_handlers: Spinlock<BTreeMap<RegionSpace, Box<dyn RegionHandler>>>,
    /// Regions whose `_REG` could not run yet because no handler for their space exists.
    regions_awaiting_reg: Spinlock<Vec<AmlName>>,
    notify_handlers: Spinlock<Vec<(AmlName, NotifyHandler)>>,
    /// Mutexes acquired by AML outside of any method (possible at table load time). Mutexes
    /// acquired inside a method live on that method's context instead.
    global_mutexes: Spinlock<Vec<Arc<Object>>>,
    /// How deep method calls may nest before evaluation is aborted.
    pub max_callstack_depth: usize,
    /// How long a single `While` loop may spin before evaluation is aborted.
    pub loop_timeout_nanos: u64,
}

const DEFAULT_MAX_CALLSTACK_DEPTH: usize = 256;
const DEFAULT_LOOP_TIMEOUT_NANOS: u64 = 2_000_000_000;

enum AcquireOutcome {
    Acquired,
    AlreadyOwned,
    TimedOut,
}

impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Create an interpreter with an empty (but pre-defined-node-populated) namespace.
    /// `dsdt_revision` governs the integer width used for tables loaded with [`Self::load_table`]:
    /// revisions before 2 use 32-bit integers.
    pub fn new(handler: H, dsdt_revision: u8) -> Interpreter<H> {
        info!("Initializing AML interpreter v{}", env!("CARGO_PKG_VERSION"));

        let mut namespace = Namespace::new();
        // `\_GL_` is created here rather than in `Namespace::new` because it needs a host handle
        let global_lock =
            Object::Mutex { mutex: handler.create_mutex(), sync_level: 0, owner: None, recursion: 0 };
        namespace.insert(AmlName::from_str("\\_GL").unwrap(), global_lock.wrap()).unwrap();

        Interpreter {
            handler,
            namespace: Spinlock::new(namespace),
            dsdt_revision,
            region_handlers: Spinlock::new(BTreeMap::new()),
            regions_awaiting_reg: Spinlock::new(Vec::new()),
            notify_handlers: Spinlock::new(Vec::new()),
            global_mutexes: Spinlock::new(Vec::new()),
            max_callstack_depth: DEFAULT_MAX_CALLSTACK_DEPTH,
            loop_timeout_nanos: DEFAULT_LOOP_TIMEOUT_NANOS,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Load a raw AML stream (a table body without its SDT header), populating the namespace.
    /// Uses the DSDT revision supplied at construction to pick the integer width.
    pub fn load_table(&self, stream: &[u8]) -> Result<(), AmlError> {
        let context = unsafe { MethodContext::new_from_table(stream, self.dsdt_revision >= 2) };
        self.do_execute_method(context)?;
        Ok(())
    }

    /// Load a full DSDT or SSDT image, header included. The table's own revision selects the
    /// integer width for methods it declares, so mixed-revision table sets behave per-table.
    pub fn load_sdt(&self, table: &[u8]) -> Result<(), AmlError> {
        let header = SdtHeader::parse(table)?;
        if &header.signature != b"DSDT" && &header.signature != b"SSDT" {
            return Err(AmlError::TableInvalidSignature(header.signature));
        }
        info!("Loading AML table: {}", header);

        let stream = &table[tables::SDT_HEADER_LENGTH..header.length as usize];
        let context = unsafe { MethodContext::new_from_table(stream, header.revision >= 2) };
        self.do_execute_method(context)?;
        Ok(())
    }

    /// Evaluate an object at the given path. Methods are invoked with the supplied arguments;
    /// any other object is returned as-is (useful for objects that can be defined either directly
    /// or through a method, e.g. `_CRS`).
    pub fn evaluate(&self, path: AmlName, args: Vec<Arc<Object>>) -> Result<Arc<Object>, AmlError> {
        trace!("Evaluating AML object: {}", path);

        let search_result = { self.namespace.lock().search(&path, &AmlName::root()) };
        let (resolved_path, object) = search_result?;

        match *object {
            Object::Method { .. } => {
                let context = self.prepare_method_context(object.clone(), args, resolved_path)?;
                self.do_execute_method(context)
            }
            Object::NativeMethod { f, arg_count } => {
                if args.len() != arg_count {
                    return Err(AmlError::MethodArgCountIncorrect);
                }
                f(&args)
            }
            _ => Ok(object),
        }
    }

    /// Like [`Self::evaluate`], but a missing object is `Ok(None)` rather than an error. Errors
    /// from within a found method still propagate. `_STA`-style objects are routinely absent, so
    /// most internal consumers come through here.
    pub fn evaluate_if_present(
        &self,
        path: AmlName,
        args: Vec<Arc<Object>>,
    ) -> Result<Option<Arc<Object>>, AmlError> {
        match self.evaluate(path.clone(), args) {
            Ok(result) => Ok(Some(result)),
            Err(AmlError::ObjectDoesNotExist(not_present)) => {
                if path == not_present {
                    Ok(None)
                } else {
                    Err(AmlError::ObjectDoesNotExist(not_present))
                }
            }
            // A missing level on the way to the object also means "not present"
            Err(AmlError::LevelDoesNotExist(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Evaluate an object expected to produce an integer. Field units are read through to their
    /// current value.
    pub fn evaluate_int(&self, path: AmlName, args: Vec<Arc<Object>>) -> Result<u64, AmlError> {
        let object = self.evaluate(path, args)?.unwrap_transparent_reference();
        match *object {
            Object::FieldUnit(ref field) => self.do_field_read(field)?.as_integer(),
            _ => object.as_integer(),
        }
    }

    /// Evaluate an object expected to produce a buffer.
    pub fn evaluate_buffer(&self, path: AmlName, args: Vec<Arc<Object>>) -> Result<Arc<Object>, AmlError> {
        let object = self.evaluate(path, args)?.unwrap_transparent_reference();
        match *object {
            Object::Buffer(_) => Ok(object),
            _ => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: object.typ() }),
        }
    }

    /// Evaluate an object expected to produce a package. Elements should be fetched through
    /// [`Self::get_pkg_element`], which performs lazy path resolution.
    pub fn evaluate_package(&self, path: AmlName, args: Vec<Arc<Object>>) -> Result<Arc<Object>, AmlError> {
        let object = self.evaluate(path, args)?.unwrap_transparent_reference();
        match *object {
            Object::Package(_) => Ok(object),
            _ => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Package, got: object.typ() }),
        }
    }

    /// Fetch a package element, resolving it first if it is a forward path reference. Resolution
    /// rewrites the element in place, so it happens at most once per element; field-unit elements
    /// are read on every access and yield a fresh integer.
    pub fn get_pkg_element(&self, package: &Arc<Object>, index: usize) -> Result<Arc<Object>, AmlError> {
        let element = {
            let Object::Package(ref elements) = **package else {
                return Err(AmlError::ObjectNotOfExpectedType {
                    expected: ObjectType::Package,
                    got: package.typ(),
                });
            };
            elements.get(index).ok_or(AmlError::IndexOutOfBounds)?.clone()
        };

        let resolved = match *element {
            Object::Reference { kind: ReferenceKind::Unresolved { ref scope }, ref inner } => {
                let name = AmlName::from_str(&inner.as_string()?)?;
                let search_result = { self.namespace.lock().search(&name, scope) };
                let (_, object) = search_result?;

                let Object::Package(elements) = package.gain_mut() else { unreachable!() };
                elements[index] = object.clone();
                object
            }
            _ => element,
        };

        if let Object::FieldUnit(ref field) = *resolved {
            return self.do_field_read(field);
        }
        Ok(resolved)
    }

    /// Deep-copy an object. Buffers, strings, and package elements are copied recursively;
    /// cloning a mutex or event allocates a fresh host handle with the same sync level;
    /// references clone shallowly (the clone aliases the same referent).
    pub fn clone_object(&self, object: &Arc<Object>) -> Result<Arc<Object>, AmlError> {
        Ok(Arc::new(self.clone_object_contents(object)?))
    }

    fn clone_object_contents(&self, object: &Arc<Object>) -> Result<Object, AmlError> {
        Ok(match **object {
            Object::Uninitialized => Object::Uninitialized,
            Object::Integer(value) => Object::Integer(value),
            Object::String(ref value) => Object::String(value.clone()),
            Object::Buffer(ref bytes) => Object::Buffer(bytes.clone()),
            Object::Package(ref elements) => {
                let mut cloned = Vec::with_capacity(elements.len());
                for element in elements {
                    cloned.push(self.clone_object(element)?);
                }
                Object::Package(cloned)
            }
            Object::Mutex { sync_level, .. } => {
                Object::Mutex { mutex: self.handler.create_mutex(), sync_level, owner: None, recursion: 0 }
            }
            Object::Event(_) => Object::Event(self.handler.create_event()),
            Object::Reference { ref kind, ref inner } => {
                Object::Reference { kind: kind.clone(), inner: inner.clone() }
            }
            Object::BufferField { ref buffer, offset, length } => {
                Object::BufferField { buffer: buffer.clone(), offset, length }
            }
            Object::FieldUnit(ref field) => Object::FieldUnit(field.clone()),
            Object::OpRegion(ref region) => Object::OpRegion(region.clone()),
            Object::Method { ref code, flags, ref serialize_mutex, wide_integers } => Object::Method {
                code: code.clone(),
                flags,
                serialize_mutex: serialize_mutex.clone(),
                wide_integers,
            },
            Object::NativeMethod { f, arg_count } => Object::NativeMethod { f, arg_count },
            Object::Device => Object::Device,
            Object::ThermalZone => Object::ThermalZone,
            Object::Processor { proc_id, pblk_address, pblk_length } => {
                Object::Processor { proc_id, pblk_address, pblk_length }
            }
            Object::PowerResource { system_level, resource_order } => {
                Object::PowerResource { system_level, resource_order }
            }
            Object::Debug => Object::Debug,
        })
    }

    /// Install a handler for an operation-region address space. Any regions in that space whose
    /// `_REG` has been deferred get it run now.
    pub fn install_region_handler<RH>(&self, space: RegionSpace, handler: RH)
    where
        RH: RegionHandler + 'static,
    {
        {
            let mut handlers = self.region_handlers.lock();
            assert!(handlers.get(&space).is_none(), "Tried to install handler for same space twice!");
            handlers.insert(space, Box::new(handler));
        }
        self.run_pending_regs(Some(space));
    }

    pub fn install_notify_handler(&self, path: AmlName, handler: NotifyHandler) {
        self.notify_handlers.lock().push((path, handler));
    }

    pub fn remove_notify_handler(&self, path: &AmlName) {
        self.notify_handlers.lock().retain(|(p, _)| p != path);
    }

    /// Deliver a notification to the handler watching `path`, if any. This is the entry the host
    /// calls for notifications it originates; the `Notify` opcode also lands here.
    pub fn on_notify(&self, path: &AmlName, value: u64) {
        let handlers = self.notify_handlers.lock();
        for (watched, handler) in handlers.iter() {
            if watched == path {
                handler(path, value);
                break;
            }
        }
    }

    fn do_notify(&self, path: &AmlName, value: u64) {
        trace!("AML Notify: {} value {:#x}", path, value);
        self.on_notify(path, value);
        self.handler.handle_notify(path, value);
    }

    /// Run `\_INI` and `\_SB._INI`, any deferred `_REG`s whose handlers have appeared, and then
    /// walk the device tree evaluating `_STA`/`_INI` per the usual presence rules: a device that
    /// is present gets `_INI`; a device that is neither present nor functioning has its whole
    /// subtree skipped.
    pub fn initialize_namespace(&self) -> Result<(), AmlError> {
        let sb_path = AmlName::from_str("\\_SB").unwrap();

        for path in ["\\_INI", "\\_SB._INI"] {
            if let Err(err) = self.evaluate_if_present(AmlName::from_str(path).unwrap(), vec![]) {
                warn!("Error while evaluating {}: {:?}", path, err);
            }
        }

        self.run_pending_regs(None);

        let device_paths = self.collect_device_paths(&AmlName::root())?;
        let mut skipped_roots: Vec<AmlName> = Vec::new();

        'devices: for path in device_paths {
            for skipped in &skipped_roots {
                if path_is_within(&path, skipped) {
                    continue 'devices;
                }
            }

            let sta_path = AmlName::from_str("_STA").unwrap().resolve(&path)?;
            let (present, functioning) = match self.evaluate_if_present(sta_path, vec![]) {
                Ok(Some(value)) => {
                    let bits = match self.object_to_integer(&value, 8) {
                        Ok(bits) => bits,
                        Err(err) => {
                            warn!("Error reading _STA result for {}: {:?}", path, err);
                            continue;
                        }
                    };
                    let status = object::DeviceStatus(bits);
                    (status.present(), status.functioning())
                }
                Ok(None) => (true, true),
                Err(err) => {
                    warn!("Error while evaluating _STA for {}: {:?}", path, err);
                    continue;
                }
            };

            // `\_SB._INI` already ran above
            if present && path != sb_path {
                let ini_path = AmlName::from_str("_INI").unwrap().resolve(&path)?;
                if let Err(err) = self.evaluate_if_present(ini_path, vec![]) {
                    warn!("Error while evaluating _INI for {}: {:?}", path, err);
                }
            }

            if !present && !functioning {
                skipped_roots.push(path);
            }
        }

        Ok(())
    }

    /// Walk the namespace from `start` (or the root), invoking `f` on every device whose `_HID`
    /// or `_CID` matches one of `ids`. `_CID` packages match element-wise; a node is visited at
    /// most once. The visitor can stop the walk early by returning [`IterDecision::Break`].
    pub fn discover_nodes<F>(
        &self,
        start: Option<AmlName>,
        ids: &[DeviceId],
        mut f: F,
    ) -> Result<(), AmlError>
    where
        F: FnMut(&Interpreter<H>, &AmlName) -> IterDecision,
    {
        let start = start.unwrap_or(AmlName::root());
        let device_paths = self.collect_device_paths(&start)?;

        for path in device_paths {
            if self.node_matches_ids(&path, ids) {
                if f(self, &path) == IterDecision::Break {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn collect_device_paths(&self, start: &AmlName) -> Result<Vec<AmlName>, AmlError> {
        let mut paths = Vec::new();
        let namespace = self.namespace.lock();
        namespace.traverse(|path, level| {
            let device_like = matches!(
                level.kind,
                NamespaceLevelKind::Device
                    | NamespaceLevelKind::Processor
                    | NamespaceLevelKind::ThermalZone
                    | NamespaceLevelKind::PowerResource
            );
            if device_like && path_is_within(path, start) && *path != AmlName::root() {
                paths.push(path.clone());
            }
            Ok(true)
        })?;
        Ok(paths)
    }

    /// Whether the device at `path` carries one of `ids` in its `_HID` or `_CID`. Evaluation
    /// errors are logged and treated as no-match, since missing ids are routine.
    fn node_matches_ids(&self, path: &AmlName, ids: &[DeviceId]) -> bool {
        let hid_path = match AmlName::from_str("_HID").unwrap().resolve(path) {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.evaluate_if_present(hid_path, vec![]) {
            Ok(Some(result)) => {
                if object_matches_device_ids(&result, ids) {
                    return true;
                }
            }
            Ok(None) => (),
            Err(err) => warn!("Error while evaluating _HID for {}: {:?}", path, err),
        }

        let cid_path = match AmlName::from_str("_CID").unwrap().resolve(path) {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.evaluate_if_present(cid_path, vec![]) {
            Ok(Some(result)) => match *result {
                Object::Package(ref elements) => {
                    for index in 0..elements.len() {
                        if let Ok(element) = self.get_pkg_element(&result, index) {
                            if object_matches_device_ids(&element, ids) {
                                return true;
                            }
                        }
                    }
                }
                _ => {
                    if object_matches_device_ids(&result, ids) {
                        return true;
                    }
                }
            },
            Ok(None) => (),
            Err(err) => warn!("Error while evaluating _CID for {}: {:?}", path, err),
        }

        false
    }

    /// Run `_REG(space, 1)` for deferred regions. With `space == None`, every pending region
    /// whose space has a handler is attempted (used during namespace initialization); otherwise
    /// only regions of the newly-handled space.
    fn run_pending_regs(&self, space: Option<RegionSpace>) {
        let pending: Vec<AmlName> = {
            let handlers = self.region_handlers.lock();
            let mut waiting = self.regions_awaiting_reg.lock();
            let mut ready = Vec::new();
            waiting.retain(|path| {
                let region_space = {
                    match self.namespace.lock().get(path.clone()) {
                        Ok(object) => match *object {
                            Object::OpRegion(ref region) => Some(region.space),
                            _ => None,
                        },
                        Err(_) => None,
                    }
                };
                match region_space {
                    Some(region_space) => {
                        let wanted = space.map(|s| s == region_space).unwrap_or(true);
                        if wanted && handlers.contains_key(&region_space) {
                            ready.push(path.clone());
                            false
                        } else {
                            true
                        }
                    }
                    // The region has disappeared (e.g. it was method-local)
                    None => false,
                }
            });
            ready
        };

        for path in pending {
            self.run_reg_for_region(&path);
        }
    }

    fn run_reg_for_region(&self, path: &AmlName) {
        let space = {
            match self.namespace.lock().get(path.clone()) {
                Ok(object) => match *object {
                    Object::OpRegion(ref region) => region.space,
                    _ => return,
                },
                Err(_) => return,
            }
        };

        let parent = match path.parent() {
            Ok(parent) if parent != AmlName::root() => parent,
            _ => AmlName::root(),
        };
        let reg_path = match AmlName::from_str("_REG").unwrap().resolve(&parent) {
            Ok(p) => p,
            Err(_) => return,
        };

        const REGION_CONNECT: u64 = 1;
        let args = vec![Object::Integer(space.id() as u64).wrap(), Object::Integer(REGION_CONNECT).wrap()];
        match self.evaluate_if_present(reg_path, args) {
            Ok(_) => (),
            Err(err) => {
                warn!("_REG for region {} failed: {:?}", path, err);
                return;
            }
        }

        if let Ok(object) = self.namespace.lock().get(path.clone()) {
            if let Object::OpRegion(region) = object.gain_mut() {
                region.regged = true;
            }
        }
    }

    fn do_execute_method(&self, mut context: MethodContext) -> Result<Arc<Object>, AmlError> {
        let mut context_stack: Vec<MethodContext> = Vec::new();
        match self.execute_loop(&mut context_stack, &mut context) {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!("AML execution failed: {:?} - unwinding", err);
                self.unwind_method_context(&mut context);
                while let Some(mut earlier) = context_stack.pop() {
                    self.unwind_method_context(&mut earlier);
                }
                Err(err)
            }
        }
    }

    /// Release everything a method activation holds: leaked mutexes (with a warning), nodes the
    /// method created, its locals level, and finally its serialization mutex. Harmless on
    /// table-level contexts.
    fn unwind_method_context(&self, context: &mut MethodContext) {
        let Some(scope) = context.method_scope.take() else { return };

        while let Some(mutex) = context.acquired_mutexes.pop() {
            warn!("Mutex was still held when method {} returned - releasing", scope);
            self.force_release_mutex(&mutex);
        }

        {
            let mut namespace = self.namespace.lock();
            for path in context.created_nodes.drain(..) {
                let _ = namespace.remove_object(&path);
            }
            if context.remove_level_on_exit {
                let _ = namespace.remove_level(scope);
            }
        }

        if let Some(mutex) = context.serialize_mutex.take() {
            let _ = self.release_mutex_object(&mutex);
        }
    }

    /// Set up a context for invoking `method`: serialization mutex first, then the method-locals
    /// namespace level, then the frame itself.
    fn prepare_method_context(
        &self,
        method: Arc<Object>,
        args: Vec<Arc<Object>>,
        scope: AmlName,
    ) -> Result<MethodContext, AmlError> {
        let serialize_mutex = {
            let Object::Method { flags, ref serialize_mutex, .. } = *method else {
                return Err(AmlError::ObjectNotOfExpectedType {
                    expected: ObjectType::Method,
                    got: method.typ(),
                });
            };
            if args.len() != flags.arg_count() {
                return Err(AmlError::MethodArgCountIncorrect);
            }
            serialize_mutex.clone()
        };

        if let Some(ref mutex) = serialize_mutex {
            // A serialized method waits for its mutex without limit
            self.acquire_mutex_object(mutex, 0xffff)?;
        }

        let created_level = {
            let mut namespace = self.namespace.lock();
            let created = !namespace.level_exists(&scope);
            namespace.add_level(scope.clone(), NamespaceLevelKind::MethodLocals)?;
            created
        };

        let mut context = MethodContext::new_from_method(method, args, scope)?;
        context.serialize_mutex = serialize_mutex;
        context.remove_level_on_exit = created_level;
        Ok(context)
    }

    fn insert_object(
        &self,
        context: &mut MethodContext,
        path: AmlName,
        object: Arc<Object>,
    ) -> Result<(), AmlError> {
        self.namespace.lock().insert(path.clone(), object)?;
        // Nodes created by a running method vanish when it returns
        if context.method_scope.is_some() {
            context.created_nodes.push(path);
        }
        Ok(())
    }
}

impl<H> Interpreter<H>
where
    H: Handler,
{
    /*
     * This is the main loop that executes ops. Every op is handled at the top level of the loop
     * to prevent pathological native stack depths: nested AML expressions become in-flight ops
     * on an explicit stack rather than recursive calls.
     *
     * Worked example: AddOp TermArg TermArg Target
     * - The AddOp creates an in-flight op expecting 3 arguments.
     * - Going round the loop parses operands. A TermArg may itself create in-flight ops, which
     *   retire (top of loop) before the stream advances further, contributing their results to
     *   the op beneath them.
     * - Once the AddOp has its 3 arguments, it retires: the sum is stored to the target and
     *   contributed to whatever op is beneath *it*.
     */
    fn execute_loop(
        &self,
        context_stack: &mut Vec<MethodContext>,
        context: &mut MethodContext,
    ) -> Result<Arc<Object>, AmlError> {
        loop {
            /*
             * First, see if we've gathered enough arguments to complete some in-flight
             * operations.
             */
            while let Some(op) = context.in_flight.pop_if(|op| op.arguments.len() == op.expected_arguments) {
                match op.op {
                    Opcode::Add
                    | Opcode::Subtract
                    | Opcode::Multiply
                    | Opcode::Divide
                    | Opcode::ShiftLeft
                    | Opcode::ShiftRight
                    | Opcode::Mod
                    | Opcode::Nand
                    | Opcode::And
                    | Opcode::Or
                    | Opcode::Nor
                    | Opcode::Xor => self.do_binary_maths(context, op)?,
                    Opcode::Not | Opcode::FindSetLeftBit | Opcode::FindSetRightBit => {
                        self.do_unary_maths(context, op)?
                    }
                    Opcode::Increment | Opcode::Decrement => self.do_increment(context, op)?,
                    Opcode::LAnd
                    | Opcode::LOr
                    | Opcode::LNot
                    | Opcode::LNotEqual
                    | Opcode::LLessEqual
                    | Opcode::LGreaterEqual
                    | Opcode::LEqual
                    | Opcode::LGreater
                    | Opcode::LLess => self.do_logical_op(context, op)?,
                    Opcode::ToBuffer
                    | Opcode::ToDecimalString
                    | Opcode::ToHexString
                    | Opcode::ToInteger
                    | Opcode::ToString => self.do_to_conversion(context, op)?,
                    Opcode::Mid => self.do_mid(context, op)?,
                    Opcode::Concat => self.do_concat(context, op)?,
                    Opcode::ConcatRes => {
                        let [Argument::Object(source1), Argument::Object(source2), target] = &op.arguments[..]
                        else {
                            panic!()
                        };
                        let source1 = source1.clone().unwrap_transparent_reference();
                        let source2 = source2.clone().unwrap_transparent_reference();
                        let result = {
                            let mut buffer = Vec::from(source1.as_buffer()?);
                            buffer.extend_from_slice(source2.as_buffer()?);
                            // Add a new end-tag, with a zero checksum
                            buffer.push(0x79);
                            buffer.push(0x00);
                            Object::Buffer(buffer).wrap()
                        };
                        self.do_store(context, target, result.clone())?;
                        context.contribute_arg(Argument::Object(result));
                    }
                    Opcode::FromBCD => self.do_from_bcd(context, op)?,
                    Opcode::ToBCD => self.do_to_bcd(context, op)?,
                    Opcode::Name => {
                        let [Argument::Namestring(name), Argument::Object(object)] = &op.arguments[..] else {
                            panic!()
                        };
                        let path = name.resolve(&context.current_scope)?;
                        self.insert_object(context, path, object.clone())?;
                    }
                    Opcode::Fatal => {
                        let [Argument::ByteData(typ), Argument::DWordData(code), Argument::Object(arg)] =
                            &op.arguments[..]
                        else {
                            panic!()
                        };
                        let arg = self.object_to_integer(arg, context.int_size())?;
                        self.handler.handle_fatal_error(*typ, *code, arg);
                    }
                    Opcode::OpRegion => {
                        let [
                            Argument::Namestring(name),
                            Argument::ByteData(region_space),
                            Argument::Object(region_offset),
                            Argument::Object(region_length),
                        ] = &op.arguments[..]
                        else {
                            panic!()
                        };

                        let space = RegionSpace::from(*region_space);
                        let region = Region::new(
                            space,
                            self.object_to_integer(region_offset, context.int_size())?,
                            self.object_to_integer(region_length, context.int_size())?,
                            context.current_scope.clone(),
                        );
                        let needs_reg = region.needs_reg();
                        let path = name.resolve(&context.current_scope)?;
                        self.insert_object(context, path.clone(), Object::OpRegion(region).wrap())?;

                        if needs_reg {
                            let has_handler = self.region_handlers.lock().contains_key(&space);
                            if has_handler {
                                self.run_reg_for_region(&path);
                            } else {
                                self.regions_awaiting_reg.lock().push(path);
                            }
                        }
                    }
                    Opcode::Buffer => {
                        let [
                            Argument::TrackedPc(start_pc),
                            Argument::PkgLength(pkg_length),
                            Argument::Object(buffer_size),
                        ] = &op.arguments[..]
                        else {
                            panic!()
                        };
                        let buffer_size = self.object_to_integer(buffer_size, context.int_size())? as usize;

                        let init_len = pkg_length - (context.current_block.pc - start_pc);
                        if context.current_block.pc + init_len > context.current_block.stream().len() {
                            return Err(AmlError::RunOutOfStream);
                        }
                        let mut buffer = vec![0; usize::max(buffer_size, init_len)];
                        buffer[0..init_len].copy_from_slice(
                            &context.current_block.stream()
                                [context.current_block.pc..(context.current_block.pc + init_len)],
                        );
                        context.current_block.pc += init_len;

                        context.contribute_arg(Argument::Object(Object::Buffer(buffer).wrap()));
                    }
                    Opcode::VarPackage => {
                        let [Argument::Object(count)] = &op.arguments[..] else { panic!() };
                        let count = self.object_to_integer(count, context.int_size())? as usize;
                        // From here on a variable package behaves exactly like a fixed one
                        context.start_in_flight_op(OpInFlight::new(Opcode::Package, count));
                    }
                    Opcode::Package => {
                        let mut elements = Vec::with_capacity(op.expected_arguments);
                        for arg in &op.arguments {
                            let Argument::Object(object) = arg else { panic!() };
                            elements.push(object.clone());
                        }

                        /*
                         * We can complete a package's in-flight op in two ways:
                         *    - If all elements are encoded, we get here directly once the last
                         *      one has been parsed.
                         *    - If fewer are encoded, the block's end fills the rest with distinct
                         *      `Uninitialized`s and we come round again.
                         * Extra encoded elements beyond the declared count are skipped.
                         */
                        if context.peek().is_ok() {
                            warn!("AML package contains more elements than declared - ignoring the extras");
                            context.current_block.pc = context.current_block.stream().len();
                        }
                        assert_eq!(context.current_block.kind, BlockKind::Package);
                        context.current_block = context.block_stack.pop().unwrap();
                        context.contribute_arg(Argument::Object(Object::Package(elements).wrap()));
                    }
                    Opcode::If => {
                        let [
                            Argument::TrackedPc(start_pc),
                            Argument::PkgLength(then_length),
                            Argument::Object(predicate),
                        ] = &op.arguments[..]
                        else {
                            panic!()
                        };

                        let predicate = self.object_to_integer(predicate, context.int_size())?;
                        let remaining_then_length = then_length - (context.current_block.pc - start_pc);

                        if predicate > 0 {
                            context.start_new_block(BlockKind::IfThenBranch, remaining_then_length);
                        } else {
                            context.current_block.pc += remaining_then_length;
                            /*
                             * Skip over the prolog of an else branch, if present; its body then
                             * executes inline.
                             */
                            if context.peek() == Ok(DEF_ELSE_OP) {
                                context.next()?;
                                let _else_length = context.pkglength()?;
                            }
                        }
                    }
                    opcode @ Opcode::CreateBitField
                    | opcode @ Opcode::CreateByteField
                    | opcode @ Opcode::CreateWordField
                    | opcode @ Opcode::CreateDWordField
                    | opcode @ Opcode::CreateQWordField => {
                        let [Argument::Object(buffer), Argument::Object(index)] = &op.arguments[..] else {
                            panic!()
                        };
                        let name = context.namestring()?;
                        let buffer = buffer.clone().unwrap_transparent_reference();
                        let index = self.object_to_integer(index, context.int_size())? as usize;
                        let (offset, length) = match opcode {
                            Opcode::CreateBitField => (index, 1),
                            Opcode::CreateByteField => (index * 8, 8),
                            Opcode::CreateWordField => (index * 8, 16),
                            Opcode::CreateDWordField => (index * 8, 32),
                            Opcode::CreateQWordField => (index * 8, 64),
                            _ => unreachable!(),
                        };
                        self.create_buffer_field(context, name, buffer, offset, length)?;
                    }
                    Opcode::CreateField => {
                        let [
                            Argument::Object(buffer),
                            Argument::Object(bit_index),
                            Argument::Object(num_bits),
                        ] = &op.arguments[..]
                        else {
                            panic!()
                        };
                        let name = context.namestring()?;
                        let buffer = buffer.clone().unwrap_transparent_reference();
                        let bit_index = self.object_to_integer(bit_index, context.int_size())? as usize;
                        let num_bits = self.object_to_integer(num_bits, context.int_size())? as usize;
                        self.create_buffer_field(context, name, buffer, bit_index, num_bits)?;
                    }
                    Opcode::Store => {
                        let [Argument::Object(object), target] = &op.arguments[..] else { panic!() };
                        let value = object.clone().unwrap_transparent_reference();
                        self.do_store(context, target, value.clone())?;
                        context.contribute_arg(Argument::Object(value));
                    }
                    Opcode::CopyObject => self.do_copy_object(context, op)?,
                    Opcode::RefOf => {
                        let [Argument::Object(object)] = &op.arguments[..] else { panic!() };
                        let reference =
                            Object::Reference { kind: ReferenceKind::RefOf, inner: object.clone() }.wrap();
                        context.contribute_arg(Argument::Object(reference));
                    }
                    Opcode::CondRefOf => {
                        let [Argument::Object(object), target] = &op.arguments[..] else { panic!() };
                        let result = if let Object::Reference { kind: ReferenceKind::Unresolved { .. }, .. } =
                            **object
                        {
                            Object::Integer(0)
                        } else {
                            let reference =
                                Object::Reference { kind: ReferenceKind::RefOf, inner: object.clone() }.wrap();
                            self.do_store(context, target, reference)?;
                            Object::Integer(context.ones())
                        };
                        context.contribute_arg(Argument::Object(result.wrap()));
                    }
                    Opcode::DerefOf => self.do_deref_of(context, op)?,
                    Opcode::Sleep => {
                        let [Argument::Object(msec)] = &op.arguments[..] else { panic!() };
                        self.handler.sleep(self.object_to_integer(msec, context.int_size())?);
                    }
                    Opcode::Stall => {
                        let [Argument::Object(usec)] = &op.arguments[..] else { panic!() };
                        self.handler.stall(self.object_to_integer(usec, context.int_size())?);
                    }
                    Opcode::Acquire => self.do_acquire(context, op)?,
                    Opcode::Release => self.do_release(context, op)?,
                    Opcode::Wait => self.do_wait(context, op)?,
                    Opcode::Signal => {
                        let [Argument::Object(event)] = &op.arguments[..] else { panic!() };
                        let event = event.clone().unwrap_transparent_reference();
                        let Object::Event(handle) = *event else {
                            return Err(AmlError::ObjectNotOfExpectedType {
                                expected: ObjectType::Event,
                                got: event.typ(),
                            });
                        };
                        self.handler.signal_event(handle);
                    }
                    Opcode::Reset => {
                        let [Argument::Object(event)] = &op.arguments[..] else { panic!() };
                        let event = event.clone().unwrap_transparent_reference();
                        let Object::Event(handle) = *event else {
                            return Err(AmlError::ObjectNotOfExpectedType {
                                expected: ObjectType::Event,
                                got: event.typ(),
                            });
                        };
                        self.handler.reset_event(handle);
                    }
                    Opcode::Notify => {
                        let [target, Argument::Object(value)] = &op.arguments[..] else { panic!() };
                        let value = self.object_to_integer(value, context.int_size())?;
                        let path = match target {
                            Argument::Namestring(path) => path.clone(),
                            Argument::Object(object) => {
                                let object = object.clone().unwrap_transparent_reference();
                                self.find_object_path(&object)?
                            }
                            _ => panic!(),
                        };
                        self.do_notify(&path, value);
                    }
                    Opcode::InternalMethodCall => {
                        let [Argument::Object(method), Argument::Namestring(method_scope)] = &op.arguments[0..2]
                        else {
                            panic!()
                        };

                        let args: Vec<Arc<Object>> = op.arguments[2..]
                            .iter()
                            .map(|arg| {
                                if let Argument::Object(arg) = arg {
                                    arg.clone()
                                } else {
                                    panic!();
                                }
                            })
                            .collect();

                        match **method {
                            Object::NativeMethod { f, .. } => {
                                let result = f(&args)?;
                                context.contribute_arg(Argument::Object(result));
                            }
                            _ => {
                                if context_stack.len() + 1 >= self.max_callstack_depth {
                                    return Err(AmlError::CallStackDepthLimitExceeded);
                                }
                                let new_context =
                                    self.prepare_method_context(method.clone(), args, method_scope.clone())?;
                                let old_context = mem::replace(context, new_context);
                                context_stack.push(old_context);
                            }
                        }
                    }
                    Opcode::Return => {
                        let [Argument::Object(object)] = &op.arguments[..] else { panic!() };
                        let object = object.clone().unwrap_transparent_reference();

                        self.unwind_method_context(context);
                        if let Some(last) = context_stack.pop() {
                            *context = last;
                            context.contribute_arg(Argument::Object(object));
                        } else {
                            /*
                             * This is a `Return` from the outermost context - the result of the
                             * whole evaluation.
                             */
                            return Ok(object);
                        }
                    }
                    Opcode::ObjectType => {
                        let [Argument::Object(object)] = &op.arguments[..] else { panic!() };
                        let typ = match object.typ() {
                            ObjectType::Uninitialized => 0,
                            ObjectType::Integer => 1,
                            ObjectType::String => 2,
                            ObjectType::Buffer => 3,
                            ObjectType::Package => 4,
                            ObjectType::FieldUnit => 5,
                            ObjectType::Device => 6,
                            ObjectType::Event => 7,
                            ObjectType::Method => 8,
                            ObjectType::Mutex => 9,
                            ObjectType::OpRegion => 10,
                            ObjectType::PowerResource => 11,
                            ObjectType::Processor => 12,
                            ObjectType::ThermalZone => 13,
                            ObjectType::BufferField => 14,
                            // XXX: 15 is reserved
                            ObjectType::Debug => 16,
                            ObjectType::Reference => 0,
                        };
                        context.contribute_arg(Argument::Object(Object::Integer(typ).wrap()));
                    }
                    Opcode::SizeOf => self.do_size_of(context, op)?,
                    Opcode::Index => self.do_index(context, op)?,
                    Opcode::Match => {
                        // The first match operator byte sits after the package in the stream
                        let match_op = context.next()?;
                        let mut arguments = op.arguments;
                        arguments.push(Argument::ByteData(match_op));
                        context.start_in_flight_op(OpInFlight::new_with(Opcode::InternalMatch(1), arguments, 1));
                    }
                    Opcode::InternalMatch(1) => {
                        let match_op = context.next()?;
                        let mut arguments = op.arguments;
                        arguments.push(Argument::ByteData(match_op));
                        context.start_in_flight_op(OpInFlight::new_with(Opcode::InternalMatch(2), arguments, 1));
                    }
                    Opcode::InternalMatch(2) => {
                        context.start_in_flight_op(OpInFlight::new_with(Opcode::InternalMatch(3), op.arguments, 1));
                    }
                    Opcode::InternalMatch(_) => self.do_match(context, op)?,
                    Opcode::BankField => {
                        let [
                            Argument::TrackedPc(start_pc),
                            Argument::PkgLength(pkg_length),
                            Argument::Namestring(region_name),
                            Argument::Namestring(bank_name),
                            Argument::Object(bank_value),
                        ] = &op.arguments[..]
                        else {
                            panic!()
                        };
                        let bank_value = self.object_to_integer(bank_value, context.int_size())?;
                        let field_flags = context.next()?;

                        let (region, bank) = {
                            let namespace = self.namespace.lock();
                            let (_, region) = namespace.search(region_name, &context.current_scope)?;
                            let (_, bank) = namespace.search(bank_name, &context.current_scope)?;
                            (region, bank)
                        };

                        let kind = FieldUnitKind::Bank { region, bank, bank_value };
                        self.parse_field_list(context, kind, *start_pc, *pkg_length, field_flags)?;
                    }
                    Opcode::While => {
                        /*
                         * We've just evaluated the predicate for an iteration of a while loop. If
                         * false, skip out of the current block, otherwise carry on into the body.
                         */
                        let [Argument::Object(predicate)] = &op.arguments[..] else { panic!() };
                        let predicate = self.object_to_integer(predicate, context.int_size())?;

                        if predicate == 0 {
                            context.current_block = context.block_stack.pop().unwrap();
                        }
                    }
                    _ => panic!("Unexpected operation has created in-flight op!"),
                }
            }

            /*
             * Now that we've retired as many in-flight operations as we have arguments for, move
             * forward in the AML stream.
             */
            let opcode = match context.opcode() {
                Ok(opcode) => opcode,
                Err(AmlError::RunOutOfStream) => {
                    /*
                     * We've reached the end of the current block. What we should do about this
                     * depends on what type of block it was.
                     */
                    match context.current_block.kind {
                        BlockKind::Table => {
                            return Ok(Object::Uninitialized.wrap());
                        }
                        BlockKind::Method => {
                            /*
                             * The method ran off the end of its body without an explicit
                             * `Return`. A caller that wanted a value gets zero.
                             */
                            self.unwind_method_context(context);
                            if let Some(prev_context) = context_stack.pop() {
                                *context = prev_context;
                                context.contribute_arg(Argument::Object(Object::Integer(0).wrap()));
                                continue;
                            } else {
                                return Ok(Object::Integer(0).wrap());
                            }
                        }
                        BlockKind::Scope { ref old_scope } => {
                            assert!(!context.block_stack.is_empty());
                            let old_scope = old_scope.clone();
                            context.current_block = context.block_stack.pop().unwrap();
                            context.current_scope = old_scope;
                            // Go round the loop again to get the next opcode for the new block
                            continue;
                        }
                        BlockKind::Package => {
                            /*
                             * We've reached the end of the package. The in-flight op may already
                             * have been completed if the package specified all of its elements;
                             * otherwise, fill the rest in with *distinct* uninitialized objects
                             * and go round again to complete it.
                             */
                            assert!(!context.block_stack.is_empty());

                            if let Some(package_op) = context.in_flight.last_mut() {
                                if package_op.op == Opcode::Package {
                                    let num_elements_left =
                                        package_op.expected_arguments - package_op.arguments.len();
                                    for _ in 0..num_elements_left {
                                        package_op
                                            .arguments
                                            .push(Argument::Object(Object::Uninitialized.wrap()));
                                    }
                                }
                            }

                            // XXX: don't pop the package's block here; the in-flight op's
                            // completion does that (see above for why)
                            continue;
                        }
                        BlockKind::IfThenBranch => {
                            context.current_block = context.block_stack.pop().unwrap();

                            // Check for an else-branch, and skip over it. Running out of stream
                            // here just means the `If` was the last op of its block.
                            if context.peek() == Ok(DEF_ELSE_OP) {
                                context.next()?;
                                let start_pc = context.current_block.pc;
                                let else_length = context.pkglength()?;
                                context.current_block.pc += else_length - (context.current_block.pc - start_pc);
                            }

                            continue;
                        }
                        BlockKind::While { start_pc, start_time } => {
                            /*
                             * Go round again, and create a new in-flight op to look at the
                             * predicate. Runaway loops are caught here, at the iteration
                             * boundary.
                             */
                            if self.handler.nanos_since_boot().wrapping_sub(start_time) > self.loop_timeout_nanos
                            {
                                return Err(AmlError::LoopTimeout);
                            }
                            context.current_block.pc = start_pc;
                            context.start_in_flight_op(OpInFlight::new(Opcode::While, 1));
                            continue;
                        }
                    }
                }
                Err(other_err) => return Err(other_err),
            };
            match opcode {
                Opcode::Zero => {
                    /*
                     * `0x00` encodes both the integer literal and, in a target position, the null
                     * target that discards a store.
                     */
                    let is_target = context
                        .in_flight
                        .last()
                        .map(|op| argument_is_target(op.op, op.arguments.len()))
                        .unwrap_or(false);
                    if is_target {
                        context.last_op()?.arguments.push(Argument::Null);
                    } else {
                        context.last_op()?.arguments.push(Argument::Object(Object::Integer(0).wrap()));
                    }
                }
                Opcode::One => {
                    context.last_op()?.arguments.push(Argument::Object(Object::Integer(1).wrap()));
                }
                Opcode::Ones => {
                    let ones = context.ones();
                    context.last_op()?.arguments.push(Argument::Object(Object::Integer(ones).wrap()));
                }
                Opcode::Alias => {
                    let source = context.namestring()?;
                    let alias = context.namestring()?;

                    let alias = alias.resolve(&context.current_scope)?;
                    {
                        let mut namespace = self.namespace.lock();
                        let object = namespace.get(source.resolve(&context.current_scope)?)?;
                        namespace.create_alias(alias.clone(), object)?;
                    }
                    if context.method_scope.is_some() {
                        context.created_nodes.push(alias);
                    }
                }
                Opcode::Name => {
                    let name = context.namestring()?;
                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::Name,
                        vec![Argument::Namestring(name)],
                        1,
                    ));
                }
                Opcode::BytePrefix => {
                    let value = context.next()?;
                    context.last_op()?.arguments.push(Argument::Object(Object::Integer(value as u64).wrap()));
                }
                Opcode::WordPrefix => {
                    let value = context.next_u16()?;
                    context.last_op()?.arguments.push(Argument::Object(Object::Integer(value as u64).wrap()));
                }
                Opcode::DWordPrefix => {
                    let value = context.next_u32()?;
                    context.last_op()?.arguments.push(Argument::Object(Object::Integer(value as u64).wrap()));
                }
                Opcode::StringPrefix => {
                    let str_start = context.current_block.pc;
                    while context.next()? != b'\0' {}
                    let bytes = &context.current_block.stream()[str_start..(context.current_block.pc - 1)];
                    let string =
                        String::from(core::str::from_utf8(bytes).map_err(|_| AmlError::InvalidStringData)?);
                    context.last_op()?.arguments.push(Argument::Object(Object::String(string).wrap()));
                }
                Opcode::QWordPrefix => {
                    let value = context.next_u64()?;
                    context.last_op()?.arguments.push(Argument::Object(Object::Integer(value).wrap()));
                }
                Opcode::Scope => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let name = context.namestring()?;

                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);

                    let new_scope = name.resolve(&context.current_scope)?;
                    self.namespace.lock().add_level(new_scope.clone(), NamespaceLevelKind::Scope)?;

                    let old_scope = mem::replace(&mut context.current_scope, new_scope);
                    context.start_new_block(BlockKind::Scope { old_scope }, remaining_length);
                }
                Opcode::Buffer => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::Buffer,
                        vec![Argument::TrackedPc(start_pc), Argument::PkgLength(pkg_length)],
                        1,
                    ));
                }
                Opcode::Package => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let num_elements = context.next()?;

                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);

                    /*
                     * We now need to interpret an arbitrary number of package elements, bounded
                     * by the remaining pkglength. This may be less than `num_elements` - the
                     * remaining elements of the package are uninitialized. We utilise a
                     * combination of a block to manage the pkglength, plus an in-flight op to
                     * store interpreted elements.
                     */
                    context.start_in_flight_op(OpInFlight::new(Opcode::Package, num_elements as usize));
                    context.start_new_block(BlockKind::Package, remaining_length);
                }
                Opcode::VarPackage => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);

                    /*
                     * The element count of a variable package is a TermArg evaluated inside the
                     * package's block; the in-flight op turns into a normal `Package` once it is
                     * known.
                     */
                    context.start_new_block(BlockKind::Package, remaining_length);
                    context.start_in_flight_op(OpInFlight::new(Opcode::VarPackage, 1));
                }
                Opcode::Method => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let name = context.namestring()?;
                    let flags = MethodFlags(context.next()?);

                    let code_len = pkg_length - (context.current_block.pc - start_pc);
                    if context.current_block.pc + code_len > context.current_block.stream().len() {
                        return Err(AmlError::RunOutOfStream);
                    }
                    let code = context.current_block.stream()
                        [context.current_block.pc..(context.current_block.pc + code_len)]
                        .to_vec();
                    context.current_block.pc += code_len;

                    /*
                     * A serialized method's mutex is created once, here, and shared between all
                     * of its activations.
                     */
                    let serialize_mutex = if flags.serialize() {
                        Some(
                            Object::Mutex {
                                mutex: self.handler.create_mutex(),
                                sync_level: flags.sync_level(),
                                owner: None,
                                recursion: 0,
                            }
                            .wrap(),
                        )
                    } else {
                        None
                    };

                    let name = name.resolve(&context.current_scope)?;
                    self.insert_object(
                        context,
                        name,
                        Object::Method { code, flags, serialize_mutex, wide_integers: context.wide_integers }
                            .wrap(),
                    )?;
                }
                Opcode::External => {
                    let _name = context.namestring()?;
                    let _object_type = context.next()?;
                    let _arg_count = context.next()?;
                }
                Opcode::Mutex => {
                    let name = context.namestring()?;
                    let sync_level = context.next()?;

                    let name = name.resolve(&context.current_scope)?;
                    let mutex = Object::Mutex {
                        mutex: self.handler.create_mutex(),
                        sync_level: sync_level.get_bits(0..4),
                        owner: None,
                        recursion: 0,
                    };
                    self.insert_object(context, name, mutex.wrap())?;
                }
                Opcode::Event => {
                    let name = context.namestring()?;

                    let name = name.resolve(&context.current_scope)?;
                    self.insert_object(context, name, Object::Event(self.handler.create_event()).wrap())?;
                }
                Opcode::LoadTable => return Err(AmlError::UnsupportedOpcode(0x5b1f)),
                Opcode::Load => return Err(AmlError::UnsupportedOpcode(0x5b20)),
                Opcode::DataRegion => return Err(AmlError::UnsupportedOpcode(0x5b88)),
                Opcode::Stall => context.start_in_flight_op(OpInFlight::new(Opcode::Stall, 1)),
                Opcode::Sleep => context.start_in_flight_op(OpInFlight::new(Opcode::Sleep, 1)),
                Opcode::Acquire => context.start_in_flight_op(OpInFlight::new(Opcode::Acquire, 1)),
                Opcode::Release => context.start_in_flight_op(OpInFlight::new(Opcode::Release, 1)),
                Opcode::Signal => context.start_in_flight_op(OpInFlight::new(Opcode::Signal, 1)),
                Opcode::Wait => context.start_in_flight_op(OpInFlight::new(Opcode::Wait, 2)),
                Opcode::Reset => context.start_in_flight_op(OpInFlight::new(Opcode::Reset, 1)),
                Opcode::FromBCD | Opcode::ToBCD => context.start_in_flight_op(OpInFlight::new(opcode, 2)),
                Opcode::Revision => {
                    context.contribute_arg(Argument::Object(Object::Integer(INTERPRETER_REVISION).wrap()));
                }
                Opcode::Debug => {
                    context.contribute_arg(Argument::Object(Object::Debug.wrap()));
                }
                Opcode::Fatal => {
                    let typ = context.next()?;
                    let code = context.next_u32()?;
                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::Fatal,
                        vec![Argument::ByteData(typ), Argument::DWordData(code)],
                        1,
                    ));
                }
                Opcode::Timer => {
                    // Time has to be monotonically-increasing, in 100ns units
                    let time = self.handler.nanos_since_boot() / 100;
                    context.contribute_arg(Argument::Object(Object::Integer(time).wrap()));
                }
                Opcode::OpRegion => {
                    let name = context.namestring()?;
                    let region_space = context.next()?;
                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::OpRegion,
                        vec![Argument::Namestring(name), Argument::ByteData(region_space)],
                        2,
                    ));
                }
                Opcode::Field => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let region_name = context.namestring()?;
                    let field_flags = context.next()?;

                    let region = {
                        let (_, region) = self.namespace.lock().search(&region_name, &context.current_scope)?;
                        region
                    };
                    let kind = FieldUnitKind::Normal { region };
                    self.parse_field_list(context, kind, start_pc, pkg_length, field_flags)?;
                }
                Opcode::BankField => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let region_name = context.namestring()?;
                    let bank_name = context.namestring()?;

                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::BankField,
                        vec![
                            Argument::TrackedPc(start_pc),
                            Argument::PkgLength(pkg_length),
                            Argument::Namestring(region_name),
                            Argument::Namestring(bank_name),
                        ],
                        1,
                    ));
                }
                Opcode::IndexField => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let index_name = context.namestring()?;
                    let data_name = context.namestring()?;
                    let field_flags = context.next()?;

                    let (index, data) = {
                        let namespace = self.namespace.lock();
                        let (_, index) = namespace.search(&index_name, &context.current_scope)?;
                        let (_, data) = namespace.search(&data_name, &context.current_scope)?;
                        (index, data)
                    };
                    let kind = FieldUnitKind::Index { index, data };
                    self.parse_field_list(context, kind, start_pc, pkg_length, field_flags)?;
                }
                Opcode::Device | Opcode::ThermalZone => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let name = context.namestring()?;

                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);

                    let new_scope = name.resolve(&context.current_scope)?;
                    let (kind, object) = match opcode {
                        Opcode::Device => (NamespaceLevelKind::Device, Object::Device),
                        Opcode::ThermalZone => (NamespaceLevelKind::ThermalZone, Object::ThermalZone),
                        _ => unreachable!(),
                    };
                    self.namespace.lock().add_level(new_scope.clone(), kind)?;
                    self.insert_object(context, new_scope.clone(), object.wrap())?;

                    let old_scope = mem::replace(&mut context.current_scope, new_scope);
                    context.start_new_block(BlockKind::Scope { old_scope }, remaining_length);
                }
                Opcode::Processor => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let name = context.namestring()?;
                    let proc_id = context.next()?;
                    let pblk_address = context.next_u32()?;
                    let pblk_length = context.next()?;

                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);

                    let new_scope = name.resolve(&context.current_scope)?;
                    let object = Object::Processor { proc_id, pblk_address, pblk_length };
                    self.namespace.lock().add_level(new_scope.clone(), NamespaceLevelKind::Processor)?;
                    self.insert_object(context, new_scope.clone(), object.wrap())?;

                    let old_scope = mem::replace(&mut context.current_scope, new_scope);
                    context.start_new_block(BlockKind::Scope { old_scope }, remaining_length);
                }
                Opcode::PowerRes => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let name = context.namestring()?;
                    let system_level = context.next()?;
                    let resource_order = context.next_u16()?;

                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);

                    let new_scope = name.resolve(&context.current_scope)?;
                    let object = Object::PowerResource { system_level, resource_order };
                    self.namespace.lock().add_level(new_scope.clone(), NamespaceLevelKind::PowerResource)?;
                    self.insert_object(context, new_scope.clone(), object.wrap())?;

                    let old_scope = mem::replace(&mut context.current_scope, new_scope);
                    context.start_new_block(BlockKind::Scope { old_scope }, remaining_length);
                }
                Opcode::Local(local) => {
                    let local = context.locals[local as usize].clone();
                    context.last_op()?.arguments.push(Argument::Object(
                        Object::Reference { kind: ReferenceKind::LocalOrArg, inner: local }.wrap(),
                    ));
                }
                Opcode::Arg(arg) => {
                    let arg = context.args[arg as usize].clone();
                    context.last_op()?.arguments.push(Argument::Object(
                        Object::Reference { kind: ReferenceKind::LocalOrArg, inner: arg }.wrap(),
                    ));
                }
                Opcode::Store => context.start_in_flight_op(OpInFlight::new(Opcode::Store, 2)),
                Opcode::RefOf => context.start_in_flight_op(OpInFlight::new(Opcode::RefOf, 1)),
                Opcode::CondRefOf => context.start_in_flight_op(OpInFlight::new(opcode, 2)),
                Opcode::DerefOf => context.start_in_flight_op(OpInFlight::new(Opcode::DerefOf, 1)),
                Opcode::CopyObject => context.start_in_flight_op(OpInFlight::new(Opcode::CopyObject, 2)),
                Opcode::Notify => context.start_in_flight_op(OpInFlight::new(Opcode::Notify, 2)),

                Opcode::DualNamePrefix
                | Opcode::MultiNamePrefix
                | Opcode::Digit(_)
                | Opcode::NameChar(_)
                | Opcode::RootChar
                | Opcode::ParentPrefixChar => {
                    context.current_block.pc -= 1;
                    let name = context.namestring()?;
                    self.do_name_lookup(context, name)?;
                }

                Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::ShiftLeft
                | Opcode::ShiftRight
                | Opcode::Mod
                | Opcode::Nand
                | Opcode::And
                | Opcode::Or
                | Opcode::Nor
                | Opcode::Xor
                | Opcode::Concat => {
                    context.start_in_flight_op(OpInFlight::new(opcode, 3));
                }

                Opcode::Divide => context.start_in_flight_op(OpInFlight::new(Opcode::Divide, 4)),
                Opcode::Increment | Opcode::Decrement => context.start_in_flight_op(OpInFlight::new(opcode, 1)),
                Opcode::Not => context.start_in_flight_op(OpInFlight::new(Opcode::Not, 2)),
                Opcode::FindSetLeftBit | Opcode::FindSetRightBit => {
                    context.start_in_flight_op(OpInFlight::new(opcode, 2))
                }
                Opcode::ConcatRes => context.start_in_flight_op(OpInFlight::new(opcode, 3)),
                Opcode::SizeOf => context.start_in_flight_op(OpInFlight::new(opcode, 1)),
                Opcode::Index => context.start_in_flight_op(OpInFlight::new(opcode, 3)),
                Opcode::Match => context.start_in_flight_op(OpInFlight::new(Opcode::Match, 1)),

                Opcode::CreateBitField
                | Opcode::CreateByteField
                | Opcode::CreateWordField
                | Opcode::CreateDWordField
                | Opcode::CreateQWordField => context.start_in_flight_op(OpInFlight::new(opcode, 2)),
                Opcode::CreateField => context.start_in_flight_op(OpInFlight::new(Opcode::CreateField, 3)),

                Opcode::LAnd
                | Opcode::LOr
                | Opcode::LNotEqual
                | Opcode::LLessEqual
                | Opcode::LGreaterEqual
                | Opcode::LEqual
                | Opcode::LGreater
                | Opcode::LLess => {
                    context.start_in_flight_op(OpInFlight::new(opcode, 2));
                }
                Opcode::LNot => context.start_in_flight_op(OpInFlight::new(Opcode::LNot, 1)),

                Opcode::ToBuffer
                | Opcode::ToDecimalString
                | Opcode::ToHexString
                | Opcode::ToInteger => context.start_in_flight_op(OpInFlight::new(opcode, 2)),
                Opcode::ToString => context.start_in_flight_op(OpInFlight::new(Opcode::ToString, 3)),

                Opcode::ObjectType => context.start_in_flight_op(OpInFlight::new(opcode, 1)),
                Opcode::Mid => context.start_in_flight_op(OpInFlight::new(Opcode::Mid, 4)),
                Opcode::If => {
                    let start_pc = context.current_block.pc;
                    let then_length = context.pkglength()?;
                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::If,
                        vec![Argument::TrackedPc(start_pc), Argument::PkgLength(then_length)],
                        1,
                    ));
                }
                Opcode::Else => return Err(AmlError::ElseFoundWithoutCorrespondingIf),
                Opcode::While => {
                    let start_pc = context.current_block.pc;
                    let pkg_length = context.pkglength()?;
                    let remaining_length = pkg_length - (context.current_block.pc - start_pc);
                    context.start_new_block(
                        BlockKind::While {
                            start_pc: context.current_block.pc,
                            start_time: self.handler.nanos_since_boot(),
                        },
                        remaining_length,
                    );
                    context.start_in_flight_op(OpInFlight::new(Opcode::While, 1));
                }
                Opcode::Continue => {
                    let (start_pc, start_time) = loop {
                        if let BlockKind::While { start_pc, start_time } = context.current_block.kind {
                            break (start_pc, start_time);
                        }
                        let Some(block) = context.block_stack.pop() else {
                            return Err(AmlError::ContinueOutsideOfWhile);
                        };
                        context.current_block = block;
                    };
                    if self.handler.nanos_since_boot().wrapping_sub(start_time) > self.loop_timeout_nanos {
                        return Err(AmlError::LoopTimeout);
                    }
                    context.current_block.pc = start_pc;
                    context.start_in_flight_op(OpInFlight::new(Opcode::While, 1));
                }
                Opcode::Break => {
                    loop {
                        if let BlockKind::While { .. } = context.current_block.kind {
                            context.current_block = context.block_stack.pop().unwrap();
                            break;
                        }
                        let Some(block) = context.block_stack.pop() else {
                            return Err(AmlError::BreakOutsideOfWhile);
                        };
                        context.current_block = block;
                    }
                }
                Opcode::Return => context.start_in_flight_op(OpInFlight::new(Opcode::Return, 1)),
                Opcode::Noop => {}
                Opcode::Breakpoint => {
                    self.handler.breakpoint();
                }

                Opcode::InternalMethodCall | Opcode::InternalMatch(_) => panic!(),
            }
        }
    }

    /// Handle a namestring at the head of the stream: a method call, a named-object operand
    /// (field units are read through unless the position wants the object itself), or an
    /// unresolved forward reference in the contexts that permit one.
    fn do_name_lookup(&self, context: &mut MethodContext, name: AmlName) -> Result<(), AmlError> {
        let search_result = { self.namespace.lock().search(&name, &context.current_scope) };
        match search_result {
            Ok((resolved_name, object)) => {
                let in_package = context.current_block.kind == BlockKind::Package;
                let is_invocable = matches!(*object, Object::Method { .. } | Object::NativeMethod { .. });

                if is_invocable && !in_package {
                    let arg_count = match *object {
                        Object::Method { flags, .. } => flags.arg_count(),
                        Object::NativeMethod { arg_count, .. } => arg_count,
                        _ => unreachable!(),
                    };
                    context.start_in_flight_op(OpInFlight::new_with(
                        Opcode::InternalMethodCall,
                        vec![Argument::Object(object), Argument::Namestring(resolved_name)],
                        arg_count,
                    ));
                    return Ok(());
                }

                // `Notify` wants the path of its target, not the object behind it
                let notify_wants_path = context
                    .in_flight
                    .last()
                    .map(|op| op.op == Opcode::Notify && op.arguments.is_empty())
                    .unwrap_or(false);
                if notify_wants_path {
                    context.last_op()?.arguments.push(Argument::Namestring(resolved_name));
                    return Ok(());
                }

                /*
                 * Field units used as ordinary operands are read immediately; positions that
                 * operate on the object itself (targets, `RefOf`, sync ops, ...) get the unit.
                 * Package elements stay unread so `get_pkg_element` can read them lazily.
                 */
                let wants_object = context
                    .in_flight
                    .last()
                    .map(|op| argument_is_supername(op.op, op.arguments.len()))
                    .unwrap_or(false);
                let is_field_like = matches!(*object, Object::FieldUnit(_) | Object::BufferField { .. });

                let object = if is_field_like && !wants_object && !in_package {
                    self.read_data_object(&object)?
                } else {
                    object
                };
                context.last_op()?.arguments.push(Argument::Object(object));
                Ok(())
            }
            Err(AmlError::ObjectDoesNotExist(_)) | Err(AmlError::LevelDoesNotExist(_)) => {
                let allow_unresolved = context.current_block.kind == BlockKind::Package
                    || context.in_flight.last().map(|op| op.op == Opcode::CondRefOf).unwrap_or(false);
                if allow_unresolved {
                    let reference = Object::Reference {
                        kind: ReferenceKind::Unresolved { scope: context.current_scope.clone() },
                        inner: Object::String(name.as_string()).wrap(),
                    };
                    context.last_op()?.arguments.push(Argument::Object(reference.wrap()));
                    Ok(())
                } else {
                    Err(AmlError::ObjectDoesNotExist(name.resolve(&context.current_scope)?))
                }
            }
            Err(other) => Err(other),
        }
    }

    fn parse_field_list(
        &self,
        context: &mut MethodContext,
        kind: FieldUnitKind,
        start_pc: usize,
        pkg_length: usize,
        flags: u8,
    ) -> Result<(), AmlError> {
        const RESERVED_FIELD: u8 = 0x00;
        const ACCESS_FIELD: u8 = 0x01;
        const CONNECT_FIELD: u8 = 0x02;
        const EXTENDED_ACCESS_FIELD: u8 = 0x03;

        let mut field_offset = 0;
        let mut flags = flags;

        while context.current_block.pc < (start_pc + pkg_length) {
            match context.peek()? {
                RESERVED_FIELD => {
                    context.next()?;
                    let length = context.pkglength()?;
                    field_offset += length;
                }
                ACCESS_FIELD => {
                    context.next()?;
                    let access_type = context.next()?;
                    let _access_attrib = context.next()?;
                    // The new access type applies to the rest of the field list
                    flags = (flags & 0xf0) | (access_type & 0x0f);
                }
                EXTENDED_ACCESS_FIELD => {
                    context.next()?;
                    let access_type = context.next()?;
                    let _extended_attrib = context.next()?;
                    let _access_length = context.next()?;
                    flags = (flags & 0xf0) | (access_type & 0x0f);
                }
                CONNECT_FIELD => {
                    /*
                     * GPIO / GenericSerialBus connections carry semantics we don't implement.
                     * Refuse the table here rather than misexecute accesses later.
                     */
                    return Err(AmlError::UnsupportedFieldElement(CONNECT_FIELD));
                }
                _ => {
                    let field_name = context.namestring()?;
                    let field_length = context.pkglength()?;

                    let field = Object::FieldUnit(FieldUnit {
                        kind: kind.clone(),
                        bit_index: field_offset,
                        bit_length: field_length,
                        flags: FieldFlags(flags),
                    });
                    let path = field_name.resolve(&context.current_scope)?;
                    self.insert_object(context, path, field.wrap())?;

                    field_offset += field_length;
                }
            }
        }

        Ok(())
    }

    fn create_buffer_field(
        &self,
        context: &mut MethodContext,
        name: AmlName,
        buffer: Arc<Object>,
        offset: usize,
        length: usize,
    ) -> Result<(), AmlError> {
        let buffer_len = match *buffer {
            Object::Buffer(ref bytes) => bytes.len(),
            Object::String(ref string) => string.len(),
            _ => {
                return Err(AmlError::ObjectNotOfExpectedType {
                    expected: ObjectType::Buffer,
                    got: buffer.typ(),
                })
            }
        };
        if (offset + length).div_ceil(8) > buffer_len {
            return Err(AmlError::IndexOutOfBounds);
        }

        let path = name.resolve(&context.current_scope)?;
        self.insert_object(context, path, Object::BufferField { buffer, offset, length }.wrap())
    }
}

/// Individual opcode semantics: maths, logic, conversions, references, and synchronisation.
impl<H> Interpreter<H>
where
    H: Handler,
{
    fn do_binary_maths(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(left), Argument::Object(right)] = &op.arguments[0..2] else { panic!() };
        let int_size = context.int_size();
        let left = self.object_to_integer(left, int_size)?;
        let right = self.object_to_integer(right, int_size)?;

        if op.op == Opcode::Divide {
            if right == 0 {
                return Err(AmlError::DivideByZero);
            }
            let remainder = Object::Integer(context.mask_integer(left % right)).wrap();
            let quotient = Object::Integer(context.mask_integer(left / right)).wrap();
            self.do_store(context, &op.arguments[2], remainder)?;
            self.do_store(context, &op.arguments[3], quotient.clone())?;
            context.contribute_arg(Argument::Object(quotient));
            return Ok(());
        }

        let result = match op.op {
            Opcode::Add => left.wrapping_add(right),
            Opcode::Subtract => left.wrapping_sub(right),
            Opcode::Multiply => left.wrapping_mul(right),
            Opcode::ShiftLeft => {
                if right >= 64 {
                    0
                } else {
                    left << right
                }
            }
            Opcode::ShiftRight => {
                if right >= 64 {
                    0
                } else {
                    left >> right
                }
            }
            Opcode::Mod => {
                if right == 0 {
                    return Err(AmlError::DivideByZero);
                }
                left % right
            }
            Opcode::Nand => !(left & right),
            Opcode::And => left & right,
            Opcode::Or => left | right,
            Opcode::Nor => !(left | right),
            Opcode::Xor => left ^ right,
            _ => panic!(),
        };

        let result = Object::Integer(context.mask_integer(result)).wrap();
        self.do_store(context, &op.arguments[2], result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_unary_maths(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(operand), target] = &op.arguments[..] else { panic!() };
        let operand = context.mask_integer(self.object_to_integer(operand, context.int_size())?);

        let result = match op.op {
            Opcode::Not => context.mask_integer(!operand),
            Opcode::FindSetLeftBit => {
                // One-indexed position of the most-significant set bit, or zero
                if operand == 0 {
                    0
                } else {
                    64 - operand.leading_zeros() as u64
                }
            }
            Opcode::FindSetRightBit => {
                if operand == 0 {
                    0
                } else {
                    operand.trailing_zeros() as u64 + 1
                }
            }
            _ => panic!(),
        };

        let result = Object::Integer(result).wrap();
        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_increment(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(operand)] = &op.arguments[..] else { panic!() };
        let operand = operand.clone().unwrap_transparent_reference();

        let new_value = match *operand {
            Object::Integer(value) => {
                let new_value = context.mask_integer(match op.op {
                    Opcode::Increment => value.wrapping_add(1),
                    Opcode::Decrement => value.wrapping_sub(1),
                    _ => unreachable!(),
                });
                *operand.gain_mut() = Object::Integer(new_value);
                new_value
            }
            Object::FieldUnit(ref field) => {
                let value = self.do_field_read(field)?.as_integer()?;
                let new_value = context.mask_integer(match op.op {
                    Opcode::Increment => value.wrapping_add(1),
                    Opcode::Decrement => value.wrapping_sub(1),
                    _ => unreachable!(),
                });
                self.do_field_write(field, &Object::Integer(new_value).wrap(), context.int_size())?;
                new_value
            }
            _ => {
                return Err(AmlError::InvalidOperationOnObject {
                    op: Operation::Increment,
                    typ: operand.typ(),
                })
            }
        };

        context.contribute_arg(Argument::Object(Object::Integer(new_value).wrap()));
        Ok(())
    }

    fn do_logical_op(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        if op.op == Opcode::LNot {
            let [Argument::Object(operand)] = &op.arguments[..] else { panic!() };
            let operand = self.object_to_integer(operand, context.int_size())?;
            let result = if operand == 0 { context.ones() } else { 0 };
            context.contribute_arg(Argument::Object(Object::Integer(result).wrap()));
            return Ok(());
        }

        let [Argument::Object(left), Argument::Object(right)] = &op.arguments[..] else { panic!() };

        /*
         * Some of these operations allow strings and buffers to be used as operands. NT's
         * interpreter takes the first 4 bytes of the string/buffer and compares them as an
         * integer, so that is what everyone gets.
         */
        let left = left.clone().unwrap_transparent_reference();
        let right = right.clone().unwrap_transparent_reference();
        let (left, right) = match *left {
            Object::Integer(left) => (left, self.object_to_integer(&right, context.int_size())?),
            Object::String(ref left) => {
                let left = prefix_as_integer(left.as_bytes());
                let right = prefix_as_integer(right.as_string()?.as_bytes());
                (left, right)
            }
            Object::Buffer(ref left) => {
                let left = prefix_as_integer(left);
                let right = prefix_as_integer(right.as_buffer()?);
                (left, right)
            }
            _ => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::LogicalOp, typ: left.typ() })
            }
        };

        let result = match op.op {
            Opcode::LAnd => (left > 0) && (right > 0),
            Opcode::LOr => (left > 0) || (right > 0),
            Opcode::LNotEqual => left != right,
            Opcode::LLessEqual => left <= right,
            Opcode::LGreaterEqual => left >= right,
            Opcode::LEqual => left == right,
            Opcode::LGreater => left > right,
            Opcode::LLess => left < right,
            _ => panic!(),
        };
        let result = Object::Integer(if result { context.ones() } else { 0 }).wrap();

        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    /// The `To*` family of explicit conversions.
    fn do_to_conversion(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let int_size = context.int_size();

        let result = match op.op {
            Opcode::ToInteger => {
                let [Argument::Object(operand), _] = &op.arguments[..] else { panic!() };
                let operand = operand.clone().unwrap_transparent_reference();
                let value = match *operand {
                    Object::Integer(value) => value,
                    // Explicit conversion parses numeric strings (0x-prefixed hex, 0-prefixed
                    // octal, decimal), saturating on overflow
                    Object::String(ref value) => parse_numeric_string(value),
                    Object::Buffer(ref bytes) => {
                        let len = usize::min(bytes.len(), int_size);
                        let mut value = [0u8; 8];
                        value[0..len].copy_from_slice(&bytes[0..len]);
                        u64::from_le_bytes(value)
                    }
                    _ => {
                        return Err(AmlError::InvalidOperationOnObject {
                            op: Operation::Convert,
                            typ: operand.typ(),
                        })
                    }
                };
                Object::Integer(context.mask_integer(value)).wrap()
            }
            Opcode::ToBuffer => {
                let [Argument::Object(operand), _] = &op.arguments[..] else { panic!() };
                Object::Buffer(self.object_to_buffer(operand, int_size)?).wrap()
            }
            Opcode::ToDecimalString => {
                let [Argument::Object(operand), _] = &op.arguments[..] else { panic!() };
                let operand = operand.clone().unwrap_transparent_reference();
                let string = match *operand {
                    Object::Integer(value) => value.to_string(),
                    Object::String(ref value) => value.clone(),
                    Object::Buffer(ref bytes) => {
                        let parts: Vec<String> = bytes.iter().map(|byte| byte.to_string()).collect();
                        parts.join(",")
                    }
                    _ => self.object_to_string(&operand, int_size)?,
                };
                Object::String(string).wrap()
            }
            Opcode::ToHexString => {
                let [Argument::Object(operand), _] = &op.arguments[..] else { panic!() };
                let operand = operand.clone().unwrap_transparent_reference();
                let string = match *operand {
                    Object::Integer(value) => format!("0x{:X}", value),
                    Object::String(ref value) => value.clone(),
                    Object::Buffer(ref bytes) => {
                        let parts: Vec<String> = bytes.iter().map(|byte| format!("0x{:02X}", byte)).collect();
                        parts.join(",")
                    }
                    _ => self.object_to_string(&operand, int_size)?,
                };
                Object::String(string).wrap()
            }
            Opcode::ToString => {
                let [Argument::Object(source), Argument::Object(length), _] = &op.arguments[..] else {
                    panic!()
                };
                let source = source.clone().unwrap_transparent_reference();
                let bytes = source.as_buffer()?;
                let length = self.object_to_integer(length, int_size)?;

                // `Ones` means "no length limit"; the string always stops at the first NUL
                let limit = if length == context.ones() { bytes.len() } else { usize::min(length as usize, bytes.len()) };
                let end = bytes[0..limit].iter().position(|&b| b == 0).unwrap_or(limit);
                let string = core::str::from_utf8(&bytes[0..end]).map_err(|_| AmlError::InvalidStringData)?;
                Object::String(String::from(string)).wrap()
            }
            _ => panic!(),
        };

        let target = op.arguments.last().unwrap();
        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_mid(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(source), Argument::Object(index), Argument::Object(length), target] =
            &op.arguments[..]
        else {
            panic!()
        };
        let source = source.clone().unwrap_transparent_reference();
        let index = self.object_to_integer(index, context.int_size())? as usize;
        let length = self.object_to_integer(length, context.int_size())? as usize;

        let result = match *source {
            Object::String(ref string) => {
                if index >= string.len() {
                    Object::String(String::new())
                } else {
                    let upper = usize::min(index + length, string.len());
                    Object::String(String::from(&string[index..upper]))
                }
            }
            Object::Buffer(ref buffer) => {
                if index >= buffer.len() {
                    Object::Buffer(vec![])
                } else {
                    let upper = usize::min(index + length, buffer.len());
                    Object::Buffer(buffer[index..upper].to_vec())
                }
            }
            _ => return Err(AmlError::InvalidOperationOnObject { op: Operation::Mid, typ: source.typ() }),
        }
        .wrap();

        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_concat(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(source1), Argument::Object(source2), target] = &op.arguments[..] else {
            panic!()
        };
        let source1 = source1.clone().unwrap_transparent_reference();
        let source2 = source2.clone().unwrap_transparent_reference();
        let int_size = context.int_size();

        fn display_as_string(object: &Object) -> String {
            match object {
                Object::Uninitialized => "[Uninitialized Object]".to_string(),
                Object::Buffer(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                Object::BufferField { .. } => "[Buffer Field]".to_string(),
                Object::Device => "[Device]".to_string(),
                Object::Event(_) => "[Event]".to_string(),
                Object::FieldUnit(_) => "[Field]".to_string(),
                Object::Integer(value) => value.to_string(),
                Object::Method { .. } | Object::NativeMethod { .. } => "[Control Method]".to_string(),
                Object::Mutex { .. } => "[Mutex]".to_string(),
                Object::Reference { .. } => "[Reference]".to_string(),
                Object::OpRegion(_) => "[Operation Region]".to_string(),
                Object::Package(_) => "[Package]".to_string(),
                Object::PowerResource { .. } => "[Power Resource]".to_string(),
                Object::Processor { .. } => "[Processor]".to_string(),
                Object::String(value) => value.clone(),
                Object::ThermalZone => "[Thermal Zone]".to_string(),
                Object::Debug => "[Debug Object]".to_string(),
            }
        }

        let result = match source1.typ() {
            ObjectType::Integer => {
                let value1 = source1.as_integer()?;
                let value2 = self.object_to_integer(&source2, int_size)?;
                let mut buffer = Vec::new();
                if int_size == 8 {
                    buffer.extend_from_slice(&value1.to_le_bytes());
                    buffer.extend_from_slice(&value2.to_le_bytes());
                } else {
                    buffer.extend_from_slice(&(value1 as u32).to_le_bytes());
                    buffer.extend_from_slice(&(value2 as u32).to_le_bytes());
                }
                Object::Buffer(buffer).wrap()
            }
            ObjectType::Buffer => {
                let mut buffer = source1.as_buffer()?.to_vec();
                buffer.extend(self.object_to_buffer(&source2, int_size)?);
                Object::Buffer(buffer).wrap()
            }
            _ => {
                let string1 = display_as_string(&source1);
                let string2 = display_as_string(&source2);
                Object::String(string1 + &string2).wrap()
            }
        };

        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_from_bcd(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(value), target] = &op.arguments[..] else { panic!() };
        let mut value = self.object_to_integer(value, context.int_size())?;

        let mut result = 0;
        let mut scale = 1;
        while value > 0 {
            result += (value & 0x0f) * scale;
            scale *= 10;
            value >>= 4;
        }

        let result = Object::Integer(context.mask_integer(result)).wrap();
        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_to_bcd(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(value), target] = &op.arguments[..] else { panic!() };
        let mut value = self.object_to_integer(value, context.int_size())?;

        let mut result = 0;
        let mut nibble = 0;
        while value > 0 {
            result |= (value % 10) << (4 * nibble);
            value /= 10;
            nibble += 1;
        }

        let result = Object::Integer(context.mask_integer(result)).wrap();
        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_size_of(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(object)] = &op.arguments[..] else { panic!() };
        let object = object.clone().unwrap_reference();

        let result = match *object {
            Object::Buffer(ref buffer) => buffer.len(),
            Object::String(ref str) => str.len(),
            Object::Package(ref package) => package.len(),
            _ => return Err(AmlError::InvalidOperationOnObject { op: Operation::SizeOf, typ: object.typ() }),
        };

        context.contribute_arg(Argument::Object(Object::Integer(result as u64).wrap()));
        Ok(())
    }

    fn do_index(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(object), Argument::Object(index_value), target] = &op.arguments[..] else {
            panic!()
        };
        let object = object.clone().unwrap_transparent_reference();
        let index_value = self.object_to_integer(index_value, context.int_size())? as usize;

        let result = match *object {
            Object::Buffer(_) | Object::String(_) => {
                let length = match *object {
                    Object::Buffer(ref buffer) => buffer.len(),
                    Object::String(ref string) => string.len(),
                    _ => unreachable!(),
                };
                if index_value >= length {
                    return Err(AmlError::IndexOutOfBounds);
                }

                Object::Reference {
                    kind: ReferenceKind::RefOf,
                    inner: Object::BufferField { buffer: object.clone(), offset: index_value * 8, length: 8 }
                        .wrap(),
                }
            }
            Object::Package(ref package) => {
                let Some(element) = package.get(index_value) else { return Err(AmlError::IndexOutOfBounds) };
                Object::Reference { kind: ReferenceKind::RefOf, inner: element.clone() }
            }
            _ => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::Index, typ: object.typ() })
            }
        }
        .wrap();

        self.do_store(context, target, result.clone())?;
        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_match(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [
            Argument::Object(package),
            Argument::ByteData(match_op1),
            Argument::Object(operand1),
            Argument::ByteData(match_op2),
            Argument::Object(operand2),
            Argument::Object(start_index),
        ] = &op.arguments[..]
        else {
            panic!()
        };

        let int_size = context.int_size();
        let package = package.clone().unwrap_transparent_reference();
        let start_index = self.object_to_integer(start_index, int_size)? as usize;
        let element_count = package.as_package()?.len();
        if start_index >= element_count {
            return Err(AmlError::IndexOutOfBounds);
        }

        let operand1 = self.object_to_integer(operand1, int_size)?;
        let operand2 = self.object_to_integer(operand2, int_size)?;

        // `Ones` when no element matched
        let mut result = context.ones();
        for index in start_index..element_count {
            let Ok(element) = self.get_pkg_element(&package, index) else { continue };
            let Ok(value) = self.object_to_integer(&element, int_size) else { continue };
            if match_operator(*match_op1, value, operand1)? && match_operator(*match_op2, value, operand2)? {
                result = index as u64;
                break;
            }
        }

        context.contribute_arg(Argument::Object(Object::Integer(result).wrap()));
        Ok(())
    }

    fn do_deref_of(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(operand)] = &op.arguments[..] else { panic!() };
        let operand = operand.clone().unwrap_transparent_reference();

        let result = match *operand {
            Object::Reference { ref inner, .. } => {
                let inner = inner.clone();
                match *inner {
                    // Dereferencing the result of an `Index` into a buffer reads the element
                    Object::BufferField { .. } | Object::FieldUnit(_) => self.read_data_object(&inner)?,
                    _ => inner,
                }
            }
            // A namestring evaluates to the object it names
            Object::String(ref path) => {
                let name = AmlName::from_str(path)?;
                let search_result = { self.namespace.lock().search(&name, &context.current_scope) };
                search_result?.1
            }
            _ => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::DerefOf, typ: operand.typ() })
            }
        };

        context.contribute_arg(Argument::Object(result));
        Ok(())
    }

    fn do_copy_object(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(source), target] = &op.arguments[..] else { panic!() };
        let source = source.clone().unwrap_transparent_reference();

        // `CopyObject` replaces the destination wholesale - no implicit conversion
        match target {
            Argument::Null => (),
            Argument::Object(target) => match **target {
                Object::Reference { kind: ReferenceKind::LocalOrArg, ref inner } => {
                    *inner.gain_mut() = self.clone_object_contents(&source)?;
                }
                Object::Reference { kind: ReferenceKind::RefOf, ref inner } => {
                    let destination = inner.clone().unwrap_reference();
                    *destination.gain_mut() = self.clone_object_contents(&source)?;
                }
                Object::Reference { kind: ReferenceKind::Unresolved { ref scope }, ref inner } => {
                    let name = AmlName::from_str(&inner.as_string()?)?;
                    let search_result = { self.namespace.lock().search(&name, scope) };
                    let (_, destination) = search_result?;
                    *destination.gain_mut() = self.clone_object_contents(&source)?;
                }
                Object::Debug => self.handler.handle_debug(&source),
                _ => *target.gain_mut() = self.clone_object_contents(&source)?,
            },
            _ => panic!(),
        }

        context.contribute_arg(Argument::Object(source));
        Ok(())
    }

    fn do_acquire(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(mutex)] = &op.arguments[..] else { panic!() };
        // The timeout is a raw word following the mutex's name in the stream
        let timeout = context.next_u16()?;
        let mutex = mutex.clone().unwrap_transparent_reference();

        if !matches!(*mutex, Object::Mutex { .. }) {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Mutex, got: mutex.typ() });
        }

        match self.acquire_mutex_object(&mutex, timeout)? {
            AcquireOutcome::TimedOut => {
                let ones = context.ones();
                context.contribute_arg(Argument::Object(Object::Integer(ones).wrap()));
            }
            AcquireOutcome::AlreadyOwned => {
                context.contribute_arg(Argument::Object(Object::Integer(0).wrap()));
            }
            AcquireOutcome::Acquired => {
                if context.method_scope.is_some() {
                    context.acquired_mutexes.push(mutex.clone());
                } else {
                    self.global_mutexes.lock().push(mutex.clone());
                }
                context.contribute_arg(Argument::Object(Object::Integer(0).wrap()));
            }
        }
        Ok(())
    }

    fn do_release(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(mutex)] = &op.arguments[..] else { panic!() };
        let mutex = mutex.clone().unwrap_transparent_reference();

        if !matches!(*mutex, Object::Mutex { .. }) {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Mutex, got: mutex.typ() });
        }

        let fully_released = self.release_mutex_object(&mutex)?;
        if fully_released {
            let removed = {
                let before = context.acquired_mutexes.len();
                context.acquired_mutexes.retain(|m| !Arc::ptr_eq(m, &mutex));
                before != context.acquired_mutexes.len()
            };
            if !removed {
                self.global_mutexes.lock().retain(|m| !Arc::ptr_eq(m, &mutex));
            }
        }
        Ok(())
    }

    fn do_wait(&self, context: &mut MethodContext, op: OpInFlight) -> Result<(), AmlError> {
        let [Argument::Object(event), Argument::Object(timeout)] = &op.arguments[..] else { panic!() };
        let event = event.clone().unwrap_transparent_reference();
        let Object::Event(handle) = *event else {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Event, got: event.typ() });
        };

        let timeout = u64::min(self.object_to_integer(timeout, context.int_size())?, 0xffff) as u16;

        match self.handler.wait_for_event(handle, timeout) {
            Ok(()) => context.contribute_arg(Argument::Object(Object::Integer(0).wrap())),
            Err(AmlError::Timeout) => {
                let ones = context.ones();
                context.contribute_arg(Argument::Object(Object::Integer(ones).wrap()));
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    fn acquire_mutex_object(&self, mutex: &Arc<Object>, timeout: u16) -> Result<AcquireOutcome, AmlError> {
        let thread = self.handler.thread_id();
        let handle = {
            let Object::Mutex { mutex: handle, owner, recursion, .. } = mutex.gain_mut() else {
                return Err(AmlError::ObjectNotOfExpectedType {
                    expected: ObjectType::Mutex,
                    got: mutex.typ(),
                });
            };
            if *owner == Some(thread) {
                *recursion += 1;
                return Ok(AcquireOutcome::AlreadyOwned);
            }
            *handle
        };

        match self.handler.acquire(handle, timeout) {
            Ok(()) => {
                let Object::Mutex { owner, .. } = mutex.gain_mut() else { unreachable!() };
                *owner = Some(thread);
                Ok(AcquireOutcome::Acquired)
            }
            Err(AmlError::Timeout) => Ok(AcquireOutcome::TimedOut),
            Err(other) => Err(other),
        }
    }

    /// Release one level of a mutex. Returns whether the host mutex was actually unlocked (as
    /// opposed to a recursion count being decremented).
    fn release_mutex_object(&self, mutex: &Arc<Object>) -> Result<bool, AmlError> {
        let thread = self.handler.thread_id();
        let Object::Mutex { mutex: handle, owner, recursion, .. } = mutex.gain_mut() else {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Mutex, got: mutex.typ() });
        };
        if *owner != Some(thread) {
            return Err(AmlError::MutexNotOwned);
        }
        if *recursion > 0 {
            *recursion -= 1;
            return Ok(false);
        }
        *owner = None;
        self.handler.release(*handle);
        Ok(true)
    }

    fn force_release_mutex(&self, mutex: &Arc<Object>) {
        if let Object::Mutex { mutex: handle, owner, recursion, .. } = mutex.gain_mut() {
            if owner.is_some() {
                *owner = None;
                *recursion = 0;
                self.handler.release(*handle);
            }
        }
    }

    fn find_object_path(&self, object: &Arc<Object>) -> Result<AmlName, AmlError> {
        let mut found = None;
        {
            let namespace = self.namespace.lock();
            namespace.traverse(|path, level| {
                for (seg, (_, value)) in level.values.iter() {
                    if Arc::ptr_eq(value, object) {
                        found = Some(AmlName::from_name_seg(*seg).resolve(path)?);
                        return Ok(false);
                    }
                }
                Ok(true)
            })?;
        }
        found.ok_or(AmlError::InvalidOperationOnObject { op: Operation::Notify, typ: object.typ() })
    }
}

/// Store semantics and the implicit conversion matrix.
impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Store `object` to `target`, following §19.3.5 of the spec: null targets discard, `Debug`
    /// goes to the host, local/arg references rebind the slot, `RefOf` references store through
    /// to their referent, and named objects are overwritten in place with type conversion.
    fn do_store(
        &self,
        context: &mut MethodContext,
        target: &Argument,
        object: Arc<Object>,
    ) -> Result<(), AmlError> {
        let value = object.unwrap_transparent_reference();
        match target {
            Argument::Null => Ok(()),
            Argument::Object(target) => match **target {
                Object::Reference { ref kind, ref inner } => match kind {
                    ReferenceKind::LocalOrArg => {
                        // Rebind the slot: the backing object is overwritten wholesale
                        *inner.gain_mut() = self.clone_object_contents(&value)?;
                        Ok(())
                    }
                    ReferenceKind::RefOf => {
                        let destination = inner.clone().unwrap_reference();
                        self.store_with_conversion(context, &destination, value)
                    }
                    ReferenceKind::Unresolved { ref scope } => {
                        let name = AmlName::from_str(&inner.as_string()?)?;
                        let search_result = { self.namespace.lock().search(&name, scope) };
                        let (_, destination) = search_result?;
                        self.store_with_conversion(context, &destination, value)
                    }
                },
                _ => self.store_with_conversion(context, target, value),
            },
            _ => panic!(),
        }
    }

    fn store_with_conversion(
        &self,
        context: &mut MethodContext,
        target: &Arc<Object>,
        value: Arc<Object>,
    ) -> Result<(), AmlError> {
        let int_size = context.int_size();
        match **target {
            Object::Integer(_) => {
                let new_value = self.object_to_integer(&value, int_size)?;
                *target.gain_mut() = Object::Integer(context.mask_integer(new_value));
                Ok(())
            }
            Object::String(_) => {
                let new_value = self.object_to_string(&value, int_size)?;
                let Object::String(existing) = target.gain_mut() else { unreachable!() };
                // In-place string stores truncate to the existing storage
                let keep = usize::min(existing.len(), new_value.len());
                *existing = String::from_utf8_lossy(&new_value.as_bytes()[0..keep]).into_owned();
                Ok(())
            }
            Object::Buffer(_) => {
                let new_value = self.object_to_buffer(&value, int_size)?;
                let Object::Buffer(existing) = target.gain_mut() else { unreachable!() };
                // Copy what fits; the rest of the destination is zeroed
                let keep = usize::min(existing.len(), new_value.len());
                existing[0..keep].copy_from_slice(&new_value[0..keep]);
                for byte in existing[keep..].iter_mut() {
                    *byte = 0;
                }
                Ok(())
            }
            Object::FieldUnit(ref field) => self.do_field_write(field, &value, int_size),
            Object::BufferField { .. } => match *value {
                Object::Integer(new_value) => target.write_buffer_field(&new_value.to_le_bytes()),
                Object::Buffer(ref bytes) => target.write_buffer_field(bytes),
                _ => {
                    let new_value = self.object_to_integer(&value, int_size)?;
                    target.write_buffer_field(&new_value.to_le_bytes())
                }
            },
            Object::Debug => {
                self.handler.handle_debug(&value);
                Ok(())
            }
            _ => {
                *target.gain_mut() = self.clone_object_contents(&value)?;
                Ok(())
            }
        }
    }

    /// Read a field-like object into a data object: field units through the region machinery,
    /// buffer fields by bit extraction. Values wider than 64 bits come back as buffers.
    fn read_data_object(&self, object: &Arc<Object>) -> Result<Arc<Object>, AmlError> {
        match **object {
            Object::FieldUnit(ref field) => self.do_field_read(field),
            Object::BufferField { length, .. } => {
                if length <= 64 {
                    let mut bytes = [0u8; 8];
                    object.read_buffer_field(&mut bytes)?;
                    Ok(Object::Integer(u64::from_le_bytes(bytes)).wrap())
                } else {
                    let mut bytes = vec![0; length.div_ceil(8)];
                    object.read_buffer_field(&mut bytes)?;
                    Ok(Object::Buffer(bytes).wrap())
                }
            }
            _ => Ok(object.clone()),
        }
    }

    /// Implicit conversion to an integer, masked to the current integer width by callers where
    /// appropriate. Numeric strings follow the prefix rules (`0x` hex, `0` octal, decimal),
    /// stopping at the first invalid digit and saturating on overflow.
    pub(crate) fn object_to_integer(&self, object: &Arc<Object>, int_size: usize) -> Result<u64, AmlError> {
        let object = object.clone().unwrap_transparent_reference();
        match *object {
            Object::Integer(value) => Ok(value),
            Object::String(ref value) => Ok(parse_numeric_string(value)),
            Object::Buffer(ref bytes) => {
                let len = usize::min(bytes.len(), int_size);
                let mut value = [0u8; 8];
                value[0..len].copy_from_slice(&bytes[0..len]);
                Ok(u64::from_le_bytes(value))
            }
            Object::BufferField { .. } | Object::FieldUnit(_) => {
                let value = self.read_data_object(&object)?;
                match *value {
                    Object::Integer(value) => Ok(value),
                    // A wide field contributes its leading bytes
                    Object::Buffer(ref bytes) => {
                        let len = usize::min(bytes.len(), int_size);
                        let mut value = [0u8; 8];
                        value[0..len].copy_from_slice(&bytes[0..len]);
                        Ok(u64::from_le_bytes(value))
                    }
                    _ => unreachable!(),
                }
            }
            _ => Err(AmlError::InvalidOperationOnObject { op: Operation::Convert, typ: object.typ() }),
        }
    }

    pub(crate) fn object_to_buffer(&self, object: &Arc<Object>, int_size: usize) -> Result<Vec<u8>, AmlError> {
        let object = object.clone().unwrap_transparent_reference();
        match *object {
            Object::Buffer(ref bytes) => Ok(bytes.clone()),
            Object::Integer(value) => match int_size {
                4 => Ok((value as u32).to_le_bytes().to_vec()),
                _ => Ok(value.to_le_bytes().to_vec()),
            },
            // A string converts to its bytes plus the NUL terminator
            Object::String(ref value) => {
                let mut bytes = value.as_bytes().to_vec();
                bytes.push(0);
                Ok(bytes)
            }
            Object::BufferField { .. } | Object::FieldUnit(_) => {
                let value = self.read_data_object(&object)?;
                match *value {
                    Object::Integer(value) => Ok(value.to_le_bytes().to_vec()),
                    Object::Buffer(ref bytes) => Ok(bytes.clone()),
                    _ => unreachable!(),
                }
            }
            _ => Err(AmlError::InvalidOperationOnObject { op: Operation::Convert, typ: object.typ() }),
        }
    }

    pub(crate) fn object_to_string(&self, object: &Arc<Object>, int_size: usize) -> Result<String, AmlError> {
        let object = object.clone().unwrap_transparent_reference();
        match *object {
            Object::String(ref value) => Ok(value.clone()),
            Object::Integer(value) => {
                /*
                 * An integer whose bytes are all printable ASCII displays as those characters
                 * (this is how EISA-style string ids survive round trips); anything else renders
                 * as bare hex digits.
                 */
                let bytes = &value.to_le_bytes()[0..int_size];
                let printable_len = bytes.iter().position(|&b| b == 0).unwrap_or(int_size);
                let is_ascii = printable_len > 0 && bytes[0..printable_len].iter().all(|&b| (0x21..=0x7e).contains(&b));
                if is_ascii {
                    Ok(String::from_utf8_lossy(&bytes[0..printable_len]).into_owned())
                } else {
                    Ok(format!("{:x}", value))
                }
            }
            Object::Buffer(ref bytes) => {
                let parts: Vec<String> = bytes.iter().map(|byte| format!("{:02X}", byte)).collect();
                Ok(parts.join(" "))
            }
            Object::BufferField { .. } | Object::FieldUnit(_) => {
                let value = self.read_data_object(&object)?;
                match *value {
                    Object::Integer(value) => {
                        let parts: Vec<String> =
                            value.to_le_bytes().iter().map(|byte| format!("{:02X}", byte)).collect();
                        Ok(parts.join(" "))
                    }
                    Object::Buffer(ref bytes) => {
                        let parts: Vec<String> = bytes.iter().map(|byte| format!("{:02X}", byte)).collect();
                        Ok(parts.join(" "))
                    }
                    _ => unreachable!(),
                }
            }
            _ => Err(AmlError::InvalidOperationOnObject { op: Operation::Convert, typ: object.typ() }),
        }
    }
}

/// Field access: reads and writes split into access-size-aligned chunks against the underlying
/// region (or index/bank indirection), with the field's update rule applied to partial chunks.
impl<H> Interpreter<H>
where
    H: Handler,
{
    /// Read a field unit. Fields up to 64 bits wide produce an `Integer`; wider fields produce a
    /// `Buffer`. Fields with the lock rule hold `\_GL_` for the duration of the access.
    pub(crate) fn do_field_read(&self, field: &FieldUnit) -> Result<Arc<Object>, AmlError> {
        trace!("AML field read. Field = {:?}", field);

        let global_lock = if field.flags.lock_rule() { Some(self.acquire_global_lock()?) } else { None };
        let result = self.do_field_read_inner(field);
        if let Some(mutex) = global_lock {
            let _ = self.release_mutex_object(&mutex);
        }
        result
    }

    fn do_field_read_inner(&self, field: &FieldUnit) -> Result<Arc<Object>, AmlError> {
        let needs_buffer = field.bit_length > 64;
        let access_width_bits = field.flags.access_type_bytes()? * 8;

        let mut output = vec![0u8; usize::max(field.bit_length.div_ceil(8), 8)];

        /*
         * Break the field read into native accesses that respect the field's access width,
         * copying each potentially-unaligned part into the destination's bit range.
         */
        let native_accesses = (field.bit_length + (field.bit_index % access_width_bits))
            .next_multiple_of(access_width_bits)
            / access_width_bits;
        let mut read_so_far = 0;
        for i in 0..native_accesses {
            let aligned_offset = object::align_down(field.bit_index + i * access_width_bits, access_width_bits);
            let raw = self.field_chunk_read(field, aligned_offset / 8)?;
            let src_index = if i == 0 { field.bit_index % access_width_bits } else { 0 };
            let remaining = field.bit_length - read_so_far;
            let length = usize::min(remaining, access_width_bits - src_index);

            object::copy_bits(&raw.to_le_bytes(), src_index, &mut output, read_so_far, length);
            read_so_far += length;
        }

        if needs_buffer {
            output.truncate(field.bit_length.div_ceil(8));
            Ok(Object::Buffer(output).wrap())
        } else {
            Ok(Object::Integer(u64::from_le_bytes(output[0..8].try_into().unwrap())).wrap())
        }
    }

    pub(crate) fn do_field_write(
        &self,
        field: &FieldUnit,
        value: &Arc<Object>,
        int_size: usize,
    ) -> Result<(), AmlError> {
        trace!("AML field write. Field = {:?}", field);

        let source = if field.bit_length > 64 {
            self.object_to_buffer(value, int_size)?
        } else {
            self.object_to_integer(value, 8)?.to_le_bytes().to_vec()
        };

        let global_lock = if field.flags.lock_rule() { Some(self.acquire_global_lock()?) } else { None };
        let result = self.do_field_write_inner(field, &source);
        if let Some(mutex) = global_lock {
            let _ = self.release_mutex_object(&mutex);
        }
        result
    }

    fn do_field_write_inner(&self, field: &FieldUnit, source: &[u8]) -> Result<(), AmlError> {
        let access_width_bits = field.flags.access_type_bytes()? * 8;

        let mut written = 0;
        let mut byte_offset = object::align_down(field.bit_index, access_width_bits) / 8;
        while written < field.bit_length {
            let bit_offset = (field.bit_index + written) % access_width_bits;
            let bits = usize::min(field.bit_length - written, access_width_bits - bit_offset);

            /*
             * A chunk the field only partially covers combines the new bits with existing ones
             * per the update rule; a fully-covered chunk is simply replaced.
             */
            let old_value = if bits == access_width_bits {
                0
            } else {
                match field.flags.update_rule() {
                    FieldUpdateRule::Preserve => self.field_chunk_read(field, byte_offset)?,
                    FieldUpdateRule::WriteAsOnes => u64::MAX,
                    FieldUpdateRule::WriteAsZeros => 0,
                }
            };

            let mask: u64 = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
            let chunk = extract_bits(source, written, bits);
            let new_value = (old_value & !(mask << bit_offset)) | ((chunk & mask) << bit_offset);

            self.field_chunk_write(field, byte_offset, new_value)?;

            written += bits;
            byte_offset += access_width_bits / 8;
        }
        Ok(())
    }

    /// One aligned native access within a field: normal fields go to their region; bank fields
    /// select their bank first; index fields write the index register and access through the
    /// data register.
    fn field_chunk_read(&self, field: &FieldUnit, byte_offset: usize) -> Result<u64, AmlError> {
        let width = field.flags.access_type_bytes()?;
        match field.kind {
            FieldUnitKind::Normal { ref region } => self.region_read(region, byte_offset, width),
            FieldUnitKind::Bank { ref region, ref bank, bank_value } => {
                self.select_bank(bank, bank_value)?;
                self.region_read(region, byte_offset, width)
            }
            FieldUnitKind::Index { ref index, ref data } => {
                let (index_field, data_field) = index_field_pair(index, data)?;
                self.do_field_write(index_field, &Object::Integer(byte_offset as u64).wrap(), 8)?;
                self.do_field_read(data_field)?.as_integer()
            }
        }
    }

    fn field_chunk_write(&self, field: &FieldUnit, byte_offset: usize, value: u64) -> Result<(), AmlError> {
        let width = field.flags.access_type_bytes()?;
        match field.kind {
            FieldUnitKind::Normal { ref region } => self.region_write(region, byte_offset, width, value),
            FieldUnitKind::Bank { ref region, ref bank, bank_value } => {
                self.select_bank(bank, bank_value)?;
                self.region_write(region, byte_offset, width, value)
            }
            FieldUnitKind::Index { ref index, ref data } => {
                let (index_field, data_field) = index_field_pair(index, data)?;
                self.do_field_write(index_field, &Object::Integer(byte_offset as u64).wrap(), 8)?;
                self.do_field_write(data_field, &Object::Integer(value).wrap(), 8)
            }
        }
    }

    fn select_bank(&self, bank: &Arc<Object>, bank_value: u64) -> Result<(), AmlError> {
        let Object::FieldUnit(ref bank_field) = **bank else {
            return Err(AmlError::InvalidOperationOnObject { op: Operation::FieldAccess, typ: bank.typ() });
        };
        self.do_field_write(bank_field, &Object::Integer(bank_value).wrap(), 8)
    }

    fn acquire_global_lock(&self) -> Result<Arc<Object>, AmlError> {
        let mutex = { self.namespace.lock().get(AmlName::from_str("\\_GL").unwrap())? };
        self.acquire_mutex_object(&mutex, 0xffff)?;
        Ok(mutex)
    }
}

/// Operation-region dispatch: native `SystemMemory`/`SystemIO`/`PciConfig` accesses, and
/// installed handlers (with the attach protocol) for everything else.
impl<H> Interpreter<H>
where
    H: Handler,
{
    fn region_read(&self, region_obj: &Arc<Object>, offset: usize, width: usize) -> Result<u64, AmlError> {
        let Object::OpRegion(ref region) = **region_obj else {
            return Err(AmlError::ObjectNotOfExpectedType {
                expected: ObjectType::OpRegion,
                got: region_obj.typ(),
            });
        };
        trace!("Native region read. Region = {:?}, offset = {:#x}, width = {}", region, offset, width);

        match region.space {
            RegionSpace::SystemMemory => {
                let address = region.base as usize + offset;
                Ok(match width {
                    1 => self.handler.read_u8(address) as u64,
                    2 => self.handler.read_u16(address) as u64,
                    4 => self.handler.read_u32(address) as u64,
                    8 => self.handler.read_u64(address),
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                })
            }
            RegionSpace::SystemIO => {
                let port = (region.base as usize + offset) as u16;
                Ok(match width {
                    1 => self.handler.read_io_u8(port) as u64,
                    2 => self.handler.read_io_u16(port) as u64,
                    4 => self.handler.read_io_u32(port) as u64,
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                })
            }
            RegionSpace::PciConfig => {
                let address = self.pci_address_for_region(region_obj)?;
                let offset = (region.base as usize + offset) as u16;
                Ok(match width {
                    1 => self.handler.read_pci_u8(address, offset) as u64,
                    2 => self.handler.read_pci_u16(address, offset) as u64,
                    4 => self.handler.read_pci_u32(address, offset) as u64,
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                })
            }
            space => {
                self.ensure_region_attached(region_obj, space)?;
                let handlers = self.region_handlers.lock();
                let handler = handlers.get(&space).ok_or(AmlError::RegionHandlerNotInstalled(space))?;
                handler.read(region, offset as u64, width)
            }
        }
    }

    fn region_write(
        &self,
        region_obj: &Arc<Object>,
        offset: usize,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        let Object::OpRegion(ref region) = **region_obj else {
            return Err(AmlError::ObjectNotOfExpectedType {
                expected: ObjectType::OpRegion,
                got: region_obj.typ(),
            });
        };
        trace!(
            "Native region write. Region = {:?}, offset = {:#x}, width = {}, value = {:#x}",
            region,
            offset,
            width,
            value
        );

        match region.space {
            RegionSpace::SystemMemory => {
                let address = region.base as usize + offset;
                match width {
                    1 => self.handler.write_u8(address, value as u8),
                    2 => self.handler.write_u16(address, value as u16),
                    4 => self.handler.write_u32(address, value as u32),
                    8 => self.handler.write_u64(address, value),
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                }
                Ok(())
            }
            RegionSpace::SystemIO => {
                let port = (region.base as usize + offset) as u16;
                match width {
                    1 => self.handler.write_io_u8(port, value as u8),
                    2 => self.handler.write_io_u16(port, value as u16),
                    4 => self.handler.write_io_u32(port, value as u32),
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                }
                Ok(())
            }
            RegionSpace::PciConfig => {
                let address = self.pci_address_for_region(region_obj)?;
                let offset = (region.base as usize + offset) as u16;
                match width {
                    1 => self.handler.write_pci_u8(address, offset, value as u8),
                    2 => self.handler.write_pci_u16(address, offset, value as u16),
                    4 => self.handler.write_pci_u32(address, offset, value as u32),
                    _ => return Err(AmlError::InvalidAccessWidth(width)),
                }
                Ok(())
            }
            space => {
                self.ensure_region_attached(region_obj, space)?;
                let handlers = self.region_handlers.lock();
                let handler = handlers.get(&space).ok_or(AmlError::RegionHandlerNotInstalled(space))?;
                handler.write(region, offset as u64, width, value)
            }
        }
    }

    /// Run the handler's `attach` callback the first time a region is accessed through it.
    fn ensure_region_attached(&self, region_obj: &Arc<Object>, space: RegionSpace) -> Result<(), AmlError> {
        let already_attached = {
            let Object::OpRegion(ref region) = **region_obj else { unreachable!() };
            region.attached
        };
        if already_attached {
            return Ok(());
        }

        {
            let handlers = self.region_handlers.lock();
            let handler = handlers.get(&space).ok_or(AmlError::RegionHandlerNotInstalled(space))?;
            let Object::OpRegion(ref region) = **region_obj else { unreachable!() };
            handler.attach(region)?;
        }

        if let Object::OpRegion(region) = region_obj.gain_mut() {
            region.attached = true;
        }
        Ok(())
    }

    /// Resolve the PCI address of a `PciConfig` region by walking up from the region's parent
    /// until a host bridge (`PNP0A03`/`PNP0A08` in `_HID`/`_CID`) is found, then evaluating
    /// `_SEG`/`_BBN`/`_ADR` on it (all optional, defaulting to zero). The result is cached on
    /// the region.
    fn pci_address_for_region(&self, region_obj: &Arc<Object>) -> Result<PciAddress, AmlError> {
        let parent = {
            let Object::OpRegion(ref region) = **region_obj else { unreachable!() };
            if let Some(address) = region.pci_address {
                return Ok(address);
            }
            region.parent_device_path.clone()
        };

        const PCI_ROOT_IDS: [DeviceId<'static>; 2] =
            [DeviceId::Eisa(EisaId(*b"PNP0A03")), DeviceId::Eisa(EisaId(*b"PNP0A08"))];

        let mut node = parent;
        let bridge = loop {
            if node == AmlName::root() {
                return Err(AmlError::PciBridgeNotFound);
            }
            if self.node_matches_ids(&node, &PCI_ROOT_IDS) {
                break node;
            }
            match node.parent() {
                Ok(parent) => node = parent,
                Err(_) => return Err(AmlError::PciBridgeNotFound),
            }
        };

        let mut read_bridge_value = |name: &str| -> Result<u64, AmlError> {
            let path = AmlName::from_str(name).unwrap().resolve(&bridge)?;
            match self.evaluate_if_present(path, vec![]) {
                Ok(Some(value)) => self.object_to_integer(&value, 8),
                Ok(None) => Ok(0),
                Err(err) => Err(err),
            }
        };

        let segment = read_bridge_value("_SEG")?;
        let bus = read_bridge_value("_BBN")?;
        let adr = read_bridge_value("_ADR")?;
        let (device, function) = (adr.get_bits(16..32), adr.get_bits(0..16));

        let address = PciAddress::new(segment as u16, bus as u8, device as u8, function as u8);
        if let Object::OpRegion(region) = region_obj.gain_mut() {
            region.pci_address = Some(address);
        }
        Ok(address)
    }
}

fn index_field_pair<'a>(
    index: &'a Arc<Object>,
    data: &'a Arc<Object>,
) -> Result<(&'a FieldUnit, &'a FieldUnit), AmlError> {
    let Object::FieldUnit(ref index_field) = **index else {
        return Err(AmlError::InvalidOperationOnObject { op: Operation::FieldAccess, typ: index.typ() });
    };
    let Object::FieldUnit(ref data_field) = **data else {
        return Err(AmlError::InvalidOperationOnObject { op: Operation::FieldAccess, typ: data.typ() });
    };
    Ok((index_field, data_field))
}

/// Extract `length` bits of `source` starting at bit `start`, as a little-endian integer.
fn extract_bits(source: &[u8], start: usize, length: usize) -> u64 {
    let mut out = [0u8; 8];
    object::copy_bits(source, start, &mut out, 0, length);
    u64::from_le_bytes(out)
}

/// The first four bytes of a string or buffer, zero-extended and read as a little-endian
/// integer. This is how the NT interpreter compares non-integer operands in logical ops.
fn prefix_as_integer(bytes: &[u8]) -> u64 {
    let mut value = [0u8; 4];
    let len = usize::min(bytes.len(), 4);
    value[0..len].copy_from_slice(&bytes[0..len]);
    u32::from_le_bytes(value) as u64
}

fn match_operator(operator: u8, value: u64, operand: u64) -> Result<bool, AmlError> {
    match operator {
        0 => Ok(true),
        1 => Ok(value == operand),
        2 => Ok(value <= operand),
        3 => Ok(value < operand),
        4 => Ok(value >= operand),
        5 => Ok(value > operand),
        other => Err(AmlError::IllegalMatchOperator(other)),
    }
}

/// Numeric string parsing for `ToInteger` and implicit string sources: optional whitespace and
/// sign, then `0x` hex / `0` octal / decimal digits, stopping at the first invalid character and
/// saturating on overflow.
fn parse_numeric_string(string: &str) -> u64 {
    let mut bytes = string.as_bytes();
    while let Some((&first, rest)) = bytes.split_first() {
        if first <= b' ' {
            bytes = rest;
        } else {
            break;
        }
    }

    let mut negate = false;
    if let Some((&first, rest)) = bytes.split_first() {
        if first == b'+' {
            bytes = rest;
        } else if first == b'-' {
            negate = true;
            bytes = rest;
        }
    }

    let base: u64 = if bytes.len() >= 2 && bytes[0] == b'0' && (bytes[1] | 0x20) == b'x' {
        bytes = &bytes[2..];
        16
    } else if bytes.first() == Some(&b'0') {
        bytes = &bytes[1..];
        8
    } else {
        10
    };

    let mut result: u64 = 0;
    for &byte in bytes {
        let digit = match byte {
            b'0'..=b'9' => (byte - b'0') as u64,
            b'a'..=b'f' => (byte - b'a' + 10) as u64,
            b'A'..=b'F' => (byte - b'A' + 10) as u64,
            _ => break,
        };
        if digit >= base {
            break;
        }
        result = match result.checked_mul(base).and_then(|r| r.checked_add(digit)) {
            Some(result) => result,
            None => return u64::MAX,
        };
    }

    if negate {
        result.wrapping_neg()
    } else {
        result
    }
}

/// Whether `path` equals `root` or sits somewhere beneath it.
fn path_is_within(path: &AmlName, root: &AmlName) -> bool {
    path.0.len() >= root.0.len() && path.0[0..root.0.len()] == root.0[..]
}

fn object_matches_device_ids(object: &Arc<Object>, ids: &[DeviceId]) -> bool {
    match **object {
        Object::String(ref value) => ids.iter().any(|id| match id {
            DeviceId::Str(string) => *string == value,
            DeviceId::Eisa(eisa) => EisaId::from_str(value).map(|parsed| parsed == *eisa).unwrap_or(false),
        }),
        Object::Integer(value) => {
            let decoded = EisaId::decode(value as u32);
            ids.iter().any(|id| match id {
                DeviceId::Eisa(eisa) => *eisa == decoded,
                DeviceId::Str(string) => EisaId::from_str(string).map(|parsed| parsed == decoded).unwrap_or(false),
            })
        }
        _ => false,
    }
}

/// Positions where `0x00` in the stream means the null target rather than the integer literal
/// zero. Targets are always trailing operands of the op that owns them.
fn argument_is_target(op: Opcode, index: usize) -> bool {
    match op {
        Opcode::Store => index == 1,
        Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::ShiftLeft
        | Opcode::ShiftRight
        | Opcode::Mod
        | Opcode::Nand
        | Opcode::And
        | Opcode::Or
        | Opcode::Nor
        | Opcode::Xor
        | Opcode::Concat
        | Opcode::ConcatRes => index == 2,
        Opcode::Divide => index == 2 || index == 3,
        Opcode::Not
        | Opcode::FindSetLeftBit
        | Opcode::FindSetRightBit
        | Opcode::FromBCD
        | Opcode::ToBCD
        | Opcode::ToBuffer
        | Opcode::ToDecimalString
        | Opcode::ToHexString
        | Opcode::ToInteger => index == 1,
        Opcode::ToString => index == 2,
        Opcode::Mid => index == 3,
        Opcode::Index => index == 2,
        Opcode::CondRefOf | Opcode::CopyObject => index == 1,
        _ => false,
    }
}

/// Positions that operate on a named object itself rather than its value - field units in these
/// positions must not be implicitly read.
fn argument_is_supername(op: Opcode, index: usize) -> bool {
    if argument_is_target(op, index) {
        return true;
    }
    match op {
        Opcode::RefOf
        | Opcode::CondRefOf
        | Opcode::Acquire
        | Opcode::Release
        | Opcode::Wait
        | Opcode::Signal
        | Opcode::Reset
        | Opcode::Increment
        | Opcode::Decrement
        | Opcode::ObjectType
        | Opcode::SizeOf
        | Opcode::Notify => index == 0,
        _ => false,
    }
}

/// A `MethodContext` represents a piece of running AML - either a real method activation, or the
/// top level of a table being loaded. Nested method calls swap contexts; the suspended ones sit
/// on an explicit stack in `do_execute_method`, so native recursion depth stays flat no matter
/// how deeply AML nests.
///
/// ### Safety
/// `MethodContext` does not carry the lifetime of the underlying AML stream, which for tables is
/// borrowed from the caller. This is because the interpreter needs to preempt contexts that
/// execute other methods, and those contexts have disparate lifetimes. Method bodies are kept
/// alive by the context holding a reference to the method object; table streams must outlive the
/// `load_table` call that created the context, which they do as contexts never escape it.
struct MethodContext {
    current_block: Block,
    block_stack: Vec<Block>,
    in_flight: Vec<OpInFlight>,
    args: [Arc<Object>; 8],
    locals: [Arc<Object>; 8],
    current_scope: AmlName,
    /// Integers are 64-bit for tables of revision 2 and later, 32-bit before that. Each method
    /// captures the width of the table that declared it.
    wide_integers: bool,

    /// `Some` for method activations: the scope whose locals level (and created nodes) must be
    /// torn down when the method returns.
    method_scope: Option<AmlName>,
    remove_level_on_exit: bool,
    serialize_mutex: Option<Arc<Object>>,
    /// Mutexes this activation actually locked (recursive re-acquisitions don't appear).
    /// Released, with a warning, if still held when the method returns.
    acquired_mutexes: Vec<Arc<Object>>,
    created_nodes: Vec<AmlName>,

    _method: Option<Arc<Object>>,
}

#[derive(Debug)]
struct OpInFlight {
    op: Opcode,
    expected_arguments: usize,
    arguments: Vec<Argument>,
}

#[derive(Debug)]
enum Argument {
    Object(Arc<Object>),
    Namestring(AmlName),
    ByteData(u8),
    DWordData(u32),
    TrackedPc(usize),
    PkgLength(usize),
    /// The null target: a store to it is discarded.
    Null,
}

struct Block {
    stream: *const [u8],
    pc: usize,
    kind: BlockKind,
}

impl Block {
    fn stream(&self) -> &[u8] {
        unsafe { &*self.stream }
    }
}

#[derive(Clone, PartialEq, Debug)]
enum BlockKind {
    Table,
    Method,
    Scope {
        old_scope: AmlName,
    },
    Package,
    /// Executing the then-branch of a `DefIfElse`. On completion, an else-branch, if present, is
    /// skipped over.
    IfThenBranch,
    While {
        start_pc: usize,
        /// When the loop started, for the runaway-loop watchdog.
        start_time: u64,
    },
}

impl OpInFlight {
    fn new(op: Opcode, expected_arguments: usize) -> OpInFlight {
        OpInFlight { op, expected_arguments, arguments: Vec::new() }
    }

    fn new_with(op: Opcode, arguments: Vec<Argument>, more: usize) -> OpInFlight {
        OpInFlight { op, expected_arguments: arguments.len() + more, arguments }
    }
}

const DEF_ELSE_OP: u8 = 0xa1;

impl MethodContext {
    /// ### Safety
    /// `stream` must outlive the execution of the created context.
    unsafe fn new_from_table(stream: &[u8], wide_integers: bool) -> MethodContext {
        let block = Block { stream: stream as *const [u8], pc: 0, kind: BlockKind::Table };
        MethodContext {
            current_block: block,
            block_stack: Vec::new(),
            in_flight: Vec::new(),
            args: core::array::from_fn(|_| Object::Uninitialized.wrap()),
            locals: core::array::from_fn(|_| Object::Uninitialized.wrap()),
            current_scope: AmlName::root(),
            wide_integers,
            method_scope: None,
            remove_level_on_exit: false,
            serialize_mutex: None,
            acquired_mutexes: Vec::new(),
            created_nodes: Vec::new(),
            _method: None,
        }
    }

    fn new_from_method(
        method: Arc<Object>,
        args: Vec<Arc<Object>>,
        scope: AmlName,
    ) -> Result<MethodContext, AmlError> {
        let Object::Method { ref code, flags, wide_integers, .. } = *method else {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Method, got: method.typ() });
        };
        if args.len() != flags.arg_count() {
            return Err(AmlError::MethodArgCountIncorrect);
        }

        let block = Block { stream: code.as_slice() as *const [u8], pc: 0, kind: BlockKind::Method };
        let args = core::array::from_fn(|i| {
            if let Some(arg) = args.get(i) { arg.clone() } else { Object::Uninitialized.wrap() }
        });
        let context = MethodContext {
            current_block: block,
            block_stack: Vec::new(),
            in_flight: Vec::new(),
            args,
            locals: core::array::from_fn(|_| Object::Uninitialized.wrap()),
            current_scope: scope.clone(),
            wide_integers,
            method_scope: Some(scope),
            remove_level_on_exit: false,
            serialize_mutex: None,
            acquired_mutexes: Vec::new(),
            created_nodes: Vec::new(),
            _method: Some(method.clone()),
        };
        Ok(context)
    }

    fn int_size(&self) -> usize {
        if self.wide_integers {
            8
        } else {
            4
        }
    }

    /// Integer operations are modulo the table's integer width.
    fn mask_integer(&self, value: u64) -> u64 {
        if self.wide_integers {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    fn ones(&self) -> u64 {
        self.mask_integer(u64::MAX)
    }

    fn last_op(&mut self) -> Result<&mut OpInFlight, AmlError> {
        match self.in_flight.last_mut() {
            Some(op) => Ok(op),
            None => Err(AmlError::NoCurrentOp),
        }
    }

    fn contribute_arg(&mut self, arg: Argument) {
        if let Some(in_flight) = self.in_flight.last_mut() {
            if in_flight.arguments.len() < in_flight.expected_arguments {
                in_flight.arguments.push(arg);
            }
        }
    }

    fn start_in_flight_op(&mut self, op: OpInFlight) {
        self.in_flight.push(op);
    }

    fn start_new_block(&mut self, kind: BlockKind, length: usize) {
        let block = Block {
            stream: &self.current_block.stream()[..(self.current_block.pc + length)] as *const [u8],
            pc: self.current_block.pc,
            kind,
        };
        self.current_block.pc += length;
        self.block_stack.push(mem::replace(&mut self.current_block, block));
    }

    fn opcode(&mut self) -> Result<Opcode, AmlError> {
        let opcode: u16 = match self.next()? {
            0x5b => {
                let ext = self.next()?;
                (0x5b << 8) | ext as u16
            }
            other => other as u16,
        };

        Ok(match opcode {
            0x00 => Opcode::Zero,
            0x01 => Opcode::One,
            0x06 => Opcode::Alias,
            0x08 => Opcode::Name,
            0x0a => Opcode::BytePrefix,
            0x0b => Opcode::WordPrefix,
            0x0c => Opcode::DWordPrefix,
            0x0d => Opcode::StringPrefix,
            0x0e => Opcode::QWordPrefix,
            0x10 => Opcode::Scope,
            0x11 => Opcode::Buffer,
            0x12 => Opcode::Package,
            0x13 => Opcode::VarPackage,
            0x14 => Opcode::Method,
            0x15 => Opcode::External,
            0x2e => Opcode::DualNamePrefix,
            0x2f => Opcode::MultiNamePrefix,
            0x30..=0x39 => Opcode::Digit(opcode as u8),    // b'0'..=b'9'
            0x41..=0x5a => Opcode::NameChar(opcode as u8), // b'A'..=b'Z'
            0x5b01 => Opcode::Mutex,
            0x5b02 => Opcode::Event,
            0x5b12 => Opcode::CondRefOf,
            0x5b13 => Opcode::CreateField,
            0x5b1f => Opcode::LoadTable,
            0x5b20 => Opcode::Load,
            0x5b21 => Opcode::Stall,
            0x5b22 => Opcode::Sleep,
            0x5b23 => Opcode::Acquire,
            0x5b24 => Opcode::Signal,
            0x5b25 => Opcode::Wait,
            0x5b26 => Opcode::Reset,
            0x5b27 => Opcode::Release,
            0x5b28 => Opcode::FromBCD,
            0x5b29 => Opcode::ToBCD,
            0x5b30 => Opcode::Revision,
            0x5b31 => Opcode::Debug,
            0x5b32 => Opcode::Fatal,
            0x5b33 => Opcode::Timer,
            0x5b80 => Opcode::OpRegion,
            0x5b81 => Opcode::Field,
            0x5b82 => Opcode::Device,
            0x5b83 => Opcode::Processor,
            0x5b84 => Opcode::PowerRes,
            0x5b85 => Opcode::ThermalZone,
            0x5b86 => Opcode::IndexField,
            0x5b87 => Opcode::BankField,
            0x5b88 => Opcode::DataRegion,
            0x5c => Opcode::RootChar,
            0x5e => Opcode::ParentPrefixChar,
            0x5f => Opcode::NameChar(b'_'),
            0x60..=0x67 => Opcode::Local(opcode as u8 - 0x60),
            0x68..=0x6e => Opcode::Arg(opcode as u8 - 0x68),
            0x70 => Opcode::Store,
            0x71 => Opcode::RefOf,
            0x72 => Opcode::Add,
            0x73 => Opcode::Concat,
            0x74 => Opcode::Subtract,
            0x75 => Opcode::Increment,
            0x76 => Opcode::Decrement,
            0x77 => Opcode::Multiply,
            0x78 => Opcode::Divide,
            0x79 => Opcode::ShiftLeft,
            0x7a => Opcode::ShiftRight,
            0x7b => Opcode::And,
            0x7c => Opcode::Nand,
            0x7d => Opcode::Or,
            0x7e => Opcode::Nor,
            0x7f => Opcode::Xor,
            0x80 => Opcode::Not,
            0x81 => Opcode::FindSetLeftBit,
            0x82 => Opcode::FindSetRightBit,
            0x83 => Opcode::DerefOf,
            0x84 => Opcode::ConcatRes,
            0x85 => Opcode::Mod,
            0x86 => Opcode::Notify,
            0x87 => Opcode::SizeOf,
            0x88 => Opcode::Index,
            0x89 => Opcode::Match,
            0x8a => Opcode::CreateDWordField,
            0x8b => Opcode::CreateWordField,
            0x8c => Opcode::CreateByteField,
            0x8d => Opcode::CreateBitField,
            0x8e => Opcode::ObjectType,
            0x8f => Opcode::CreateQWordField,
            0x90 => Opcode::LAnd,
            0x91 => Opcode::LOr,
            /*
             * `0x92` is a bit strange. It can be an opcode in its own right (`LNotOp`), but when
             * followed by `0x93..=0x95`, it instead serves as a negating prefix to encode
             * `LNotEqualOp`, `LLessEqualOp`, and `LGreaterEqualOp`.
             */
            0x92 => match self.peek() {
                Ok(0x93) => {
                    self.current_block.pc += 1;
                    Opcode::LNotEqual
                }
                Ok(0x94) => {
                    self.current_block.pc += 1;
                    Opcode::LLessEqual
                }
                Ok(0x95) => {
                    self.current_block.pc += 1;
                    Opcode::LGreaterEqual
                }
                _ => Opcode::LNot,
            },
            0x93 => Opcode::LEqual,
            0x94 => Opcode::LGreater,
            0x95 => Opcode::LLess,
            0x96 => Opcode::ToBuffer,
            0x97 => Opcode::ToDecimalString,
            0x98 => Opcode::ToHexString,
            0x99 => Opcode::ToInteger,
            0x9c => Opcode::ToString,
            0x9d => Opcode::CopyObject,
            0x9e => Opcode::Mid,
            0x9f => Opcode::Continue,
            0xa0 => Opcode::If,
            0xa1 => Opcode::Else,
            0xa2 => Opcode::While,
            0xa3 => Opcode::Noop,
            0xa4 => Opcode::Return,
            0xa5 => Opcode::Break,
            0xcc => Opcode::Breakpoint,
            0xff => Opcode::Ones,

            _ => return Err(AmlError::IllegalOpcode(opcode)),
        })
    }

    fn pkglength(&mut self) -> Result<usize, AmlError> {
        let lead_byte = self.next()?;
        let byte_count = lead_byte.get_bits(6..8);

        if byte_count == 0 {
            Ok(lead_byte.get_bits(0..6) as usize)
        } else {
            let mut length = lead_byte.get_bits(0..4) as usize;
            for i in 0..byte_count {
                length |= (self.next()? as usize) << (4 + i * 8);
            }
            Ok(length)
        }
    }

    fn namestring(&mut self) -> Result<AmlName, AmlError> {
        use namespace::{NameComponent, NameSeg};

        /*
         * The NameString grammar is actually a little finicky and annoying.
         *
         * NameString := <RootChar NamePath> | <PrefixPath NamePath>
         * PrefixPath := Nothing | <'^' PrefixPath>
         * NamePath := NameSeg | DualNamePath | MultiNamePath | NullName
         * DualNamePath := DualNamePrefix NameSeg NameSeg
         * MultiNamePath := MultiNamePrefix SegCount NameSeg(SegCount)
         */
        const NULL_NAME: u8 = 0x00;
        const DUAL_NAME_PREFIX: u8 = 0x2e;
        const MULTI_NAME_PREFIX: u8 = 0x2f;

        let mut components = vec![];

        match self.peek()? {
            b'\\' => {
                self.next()?;
                components.push(NameComponent::Root);
            }
            b'^' => {
                while self.peek() == Ok(b'^') {
                    self.next()?;
                    components.push(NameComponent::Prefix);
                }
            }
            _ => (),
        }

        let mut parse_seg = |context: &mut Self| -> Result<NameComponent, AmlError> {
            let seg = [context.next()?, context.next()?, context.next()?, context.next()?];
            Ok(NameComponent::Segment(NameSeg::from_bytes(seg)?))
        };

        match self.next()? {
            NULL_NAME => {}
            DUAL_NAME_PREFIX => {
                for _ in 0..2 {
                    let seg = parse_seg(self)?;
                    components.push(seg);
                }
            }
            MULTI_NAME_PREFIX => {
                let count = self.next()?;
                for _ in 0..count {
                    let seg = parse_seg(self)?;
                    components.push(seg);
                }
            }
            _ => {
                self.current_block.pc -= 1;
                let seg = parse_seg(self)?;
                components.push(seg);
            }
        }

        Ok(AmlName::from_components(components))
    }

    fn next(&mut self) -> Result<u8, AmlError> {
        if self.current_block.pc >= self.current_block.stream().len() {
            return Err(AmlError::RunOutOfStream);
        }

        let byte = self.current_block.stream()[self.current_block.pc];
        self.current_block.pc += 1;

        Ok(byte)
    }

    fn next_u16(&mut self) -> Result<u16, AmlError> {
        Ok(u16::from_le_bytes([self.next()?, self.next()?]))
    }

    fn next_u32(&mut self) -> Result<u32, AmlError> {
        Ok(u32::from_le_bytes([self.next()?, self.next()?, self.next()?, self.next()?]))
    }

    fn next_u64(&mut self) -> Result<u64, AmlError> {
        Ok(u64::from_le_bytes([
            self.next()?,
            self.next()?,
            self.next()?,
            self.next()?,
            self.next()?,
            self.next()?,
            self.next()?,
            self.next()?,
        ]))
    }

    fn peek(&self) -> Result<u8, AmlError> {
        if self.current_block.pc >= self.current_block.stream().len() {
            return Err(AmlError::RunOutOfStream);
        }

        Ok(self.current_block.stream()[self.current_block.pc])
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Opcode {
    Zero,
    One,
    Alias,
    Name,
    BytePrefix,
    WordPrefix,
    DWordPrefix,
    StringPrefix,
    QWordPrefix,
    Scope,
    Buffer,
    Package,
    VarPackage,
    Method,
    External,
    DualNamePrefix,
    MultiNamePrefix,
    Digit(u8),
    NameChar(u8),
    Mutex,
    Event,
    CondRefOf,
    CreateField,
    LoadTable,
    Load,
    Stall,
    Sleep,
    Acquire,
    Signal,
    Wait,
    Reset,
    Release,
    FromBCD,
    ToBCD,
    Revision,
    Debug,
    Fatal,
    Timer,
    OpRegion,
    Field,
    Device,
    Processor,
    PowerRes,
    ThermalZone,
    IndexField,
    BankField,
    DataRegion,
    RootChar,
    ParentPrefixChar,
    Local(u8),
    Arg(u8),
    Store,
    RefOf,
    Add,
    Concat,
    Subtract,
    Increment,
    Decrement,
    Multiply,
    Divide,
    ShiftLeft,
    ShiftRight,
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Not,
    FindSetLeftBit,
    FindSetRightBit,
    DerefOf,
    ConcatRes,
    Mod,
    Notify,
    SizeOf,
    Index,
    Match,
    CreateDWordField,
    CreateWordField,
    CreateByteField,
    CreateBitField,
    ObjectType,
    CreateQWordField,
    LAnd,
    LOr,
    LNot,
    LNotEqual,
    LLessEqual,
    LGreaterEqual,
    LEqual,
    LGreater,
    LLess,
    ToBuffer,
    ToDecimalString,
    ToHexString,
    ToInteger,
    ToString,
    CopyObject,
    Mid,
    Continue,
    If,
    Else,
    While,
    Noop,
    Return,
    Break,
    Breakpoint,
    Ones,

    /*
     * Internal opcodes are not produced from the bytecode, but are used to track special
     * in-flight ops: method invocations, and the staged operands of `Match` (whose match
     * operators are raw bytes interleaved between TermArgs).
     */
    InternalMethodCall,
    InternalMatch(u8),
}

/// The operation being attempted when an `InvalidOperationOnObject` error was produced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Mid,
    SizeOf,
    Increment,
    Index,
    LogicalOp,
    Convert,
    DerefOf,
    Notify,
    FieldAccess,
    ReadBufferField,
    WriteBufferField,
}

#[derive(Clone, PartialEq, Debug)]
pub enum AmlError {
    RunOutOfStream,
    IllegalOpcode(u16),
    /// A legal opcode this interpreter does not execute (`Load`, `LoadTable`, `DataRegion`).
    UnsupportedOpcode(u16),
    InvalidStringData,
    InvalidFieldFlags,
    UnsupportedFieldElement(u8),

    InvalidName(Option<AmlName>),
    InvalidNameSeg([u8; 4]),
    InvalidNormalizedName(AmlName),
    RootHasNoParent,
    EmptyNamesAreInvalid,
    LevelDoesNotExist(AmlName),
    NameCollision(AmlName),
    ObjectDoesNotExist(AmlName),

    NoCurrentOp,
    ElseFoundWithoutCorrespondingIf,
    ContinueOutsideOfWhile,
    BreakOutsideOfWhile,
    /// A `While` loop span the configured loop timeout.
    LoopTimeout,
    CallStackDepthLimitExceeded,

    MethodArgCountIncorrect,

    InvalidOperationOnObject { op: Operation, typ: ObjectType },
    IndexOutOfBounds,
    ObjectNotOfExpectedType { expected: ObjectType, got: ObjectType },
    DivideByZero,
    IllegalMatchOperator(u8),

    InvalidAccessWidth(usize),
    UnsupportedRegisterSpace(RegionSpace),
    RegionHandlerNotInstalled(RegionSpace),
    PciBridgeNotFound,

    /// A blocking host primitive timed out. Not always an error: `Acquire` and `Wait` turn this
    /// into their timeout result value.
    Timeout,
    MutexNotOwned,

    TableInvalidLength(u32),
    TableInvalidSignature([u8; 4]),
    TableInvalidChecksum([u8; 4]),

    NoSuchGpe(u32),
    FixedEventNotSupported,
    EventHandlerAlreadyInstalled,
    SleepStateUnsupported(u8),
    ResetNotSupported,
    QueueWorkFailed,
}

/// This trait represents the interface from the interpreter to the hosting kernel: hardware
/// access, time, synchronisation primitives, and event plumbing.
///
/// ### Implementation notes
/// Reads and writes to PCI devices must succeed for devices that are not detected during
/// enumeration of the PCI bus / do not exist. Mutexes do not need to be recursive - the
/// interpreter tracks recursion itself, above the host primitive. `0xffff` as a timeout means
/// "wait forever"; `0` means "return immediately".
pub trait Handler: Send + Sync {
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&self, address: usize, value: u8);
    fn write_u16(&self, address: usize, value: u16);
    fn write_u32(&self, address: usize, value: u32);
    fn write_u64(&self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8;
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16;
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32;

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8);
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16);
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32);

    /// Returns a monotonically-increasing value of nanoseconds.
    fn nanos_since_boot(&self) -> u64;

    /// Stall for at least the given number of **microseconds**. An implementation should not
    /// relinquish control of the processor during the stall, and for this reason, firmwares
    /// should not stall for periods of more than 100 microseconds.
    fn stall(&self, microseconds: u64);

    /// Sleep for at least the given number of **milliseconds**. An implementation may round to
    /// the closest sleep time supported, and should relinquish the processor.
    fn sleep(&self, milliseconds: u64);

    fn create_mutex(&self) -> Handle;
    /// Lock a host mutex, waiting up to `timeout` milliseconds (`0xffff` = forever). Timing out
    /// returns `Err(AmlError::Timeout)`.
    fn acquire(&self, mutex: Handle, timeout: u16) -> Result<(), AmlError>;
    fn release(&self, mutex: Handle);

    fn create_event(&self) -> Handle;
    fn signal_event(&self, event: Handle);
    fn wait_for_event(&self, event: Handle, timeout: u16) -> Result<(), AmlError>;
    fn reset_event(&self, event: Handle);

    /// An opaque id for the current thread, compared by equality for mutex-ownership tests.
    fn thread_id(&self) -> u64;

    fn breakpoint(&self) {}

    fn handle_debug(&self, _object: &Object) {}

    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        panic!(
            "Fatal error while executing AML (encountered DefFatalOp). fatal_type = {}, fatal_code = {}, fatal_arg = {}",
            fatal_type, fatal_code, fatal_arg
        );
    }

    /// Deliver a `Notify` to the host. Handlers installed with
    /// [`Interpreter::install_notify_handler`] are invoked separately, before this.
    fn handle_notify(&self, _path: &AmlName, _value: u64) {}

    fn install_sci_handler(&self, _irq: u32) {}
    fn uninstall_sci_handler(&self, _irq: u32) {}

    /// Post a piece of event work to be run later on some host thread, via
    /// [`events::EventContext::run_work`]. That callback is allowed to re-enter the interpreter.
    /// Returns `false` if the work could not be queued.
    fn queue_work(&self, _work: events::PendingEvent) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{method, namestring, pkg, TestHandler};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn make_interpreter() -> Interpreter<TestHandler> {
        Interpreter::new(TestHandler::new(), 2)
    }

    fn name(path: &str) -> AmlName {
        AmlName::from_str(path).unwrap()
    }

    #[test]
    fn add_op() {
        let interpreter = make_interpreter();
        // AddOp 0x0e 0x06 => Local2
        interpreter.load_table(&[0x72, 0x0b, 0x0e, 0x00, 0x0a, 0x06, 0x62]).unwrap();
        // AddOp 0x0e (AddOp 0x01 0x03 => Local1) => Local1
        interpreter.load_table(&[0x72, 0x0a, 0x0e, 0x72, 0x0a, 0x01, 0x0a, 0x03, 0x61, 0x61]).unwrap();
    }

    #[test]
    fn names() {
        assert_eq!(
            unsafe { MethodContext::new_from_table(b"\\\x2eABC_DEF_\0", true) }.namestring(),
            Ok(AmlName::from_str("\\ABC.DEF").unwrap())
        );
        assert_eq!(
            unsafe { MethodContext::new_from_table(b"^^PCI0\0", true) }.namestring(),
            Ok(AmlName::from_str("^^PCI0").unwrap())
        );
    }

    #[test]
    fn method_arithmetic() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(Add(2, Multiply(3, 4))) }
        let body = [0xa4, 0x72, 0x0a, 0x02, 0x77, 0x0a, 0x03, 0x0a, 0x04, 0x00, 0x00];
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();

        let result = interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(result.as_integer(), Ok(14));
    }

    #[test]
    fn string_concat() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(Concatenate("ab", "cd")) }
        let body = [0xa4, 0x73, 0x0d, b'a', b'b', 0x00, 0x0d, b'c', b'd', 0x00, 0x00];
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();

        let result = interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(result.as_string().unwrap(), "abcd");
    }

    #[test]
    fn field_round_trip() {
        let interpreter = make_interpreter();

        // OperationRegion(OPR1, SystemMemory, 0x1000, 8)
        let mut table = vec![0x5b, 0x80];
        table.extend(namestring("OPR1"));
        table.push(0x00);
        table.push(0x0c);
        table.extend(0x1000u32.to_le_bytes());
        table.extend([0x0a, 0x08]);

        // Field(OPR1, DWordAcc, NoLock, Preserve) { FLD1, 32 }
        let mut field = namestring("OPR1");
        field.push(0x03);
        field.extend(namestring("FLD1"));
        field.push(0x20);
        table.extend([0x5b, 0x81]);
        table.extend(pkg(&field));

        // Method(MAIN) { Store(0xDEADBEEF, FLD1); Return(FLD1) }
        let mut body = vec![0x70, 0x0c];
        body.extend(0xdeadbeef_u32.to_le_bytes());
        body.extend(namestring("FLD1"));
        body.push(0xa4);
        body.extend(namestring("FLD1"));
        table.extend(method("MAIN", 0, &body));

        interpreter.load_table(&table).unwrap();
        let result = interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(result.as_integer(), Ok(0xdeadbeef));

        // The store went through the host memory callbacks
        assert_eq!(interpreter.handler().read_u32(0x1000), 0xdeadbeef);
    }

    #[test]
    fn serialized_method_mutex_recursion() {
        let interpreter = make_interpreter();

        // Mutex(MUTX, 0)
        let mut table = vec![0x5b, 0x01];
        table.extend(namestring("MUTX"));
        table.push(0x00);

        // Method(REC, 1, Serialized) {
        //     Acquire(MUTX, 0xFFFF)
        //     If(LGreater(Arg0, 0)) { REC(Subtract(Arg0, 1)) }
        //     Release(MUTX)
        // }
        let mut body = vec![0x5b, 0x23];
        body.extend(namestring("MUTX"));
        body.extend([0xff, 0xff]);
        let mut if_content = vec![0x94, 0x68, 0x00];
        if_content.extend(namestring("REC"));
        if_content.extend([0x74, 0x68, 0x01, 0x00]);
        body.push(0xa0);
        body.extend(pkg(&if_content));
        body.extend([0x5b, 0x27]);
        body.extend(namestring("MUTX"));
        table.extend(method("REC", 0x09, &body));

        interpreter.load_table(&table).unwrap();
        interpreter.evaluate(name("\\REC"), vec![Object::Integer(3).wrap()]).unwrap();

        let mutex = interpreter.namespace.lock().get(name("\\MUTX")).unwrap();
        let Object::Mutex { owner, recursion, .. } = &*mutex else { panic!() };
        assert_eq!(*owner, None);
        assert_eq!(*recursion, 0);
    }

    #[test]
    fn lazy_package_resolution() {
        let interpreter = make_interpreter();

        // Name(PKG, Package(1) { \DEV.FLD }) - the target is defined *later* in the table
        let mut package = vec![0x01];
        package.extend(namestring("\\DEV.FLD"));
        let mut table = vec![0x08];
        table.extend(namestring("PKG"));
        table.push(0x12);
        table.extend(pkg(&package));

        // Device(DEV) { OperationRegion(OPR2, SystemMemory, 0x2000, 4); Field { FLD, 32 } }
        let mut device = namestring("DEV");
        device.extend([0x5b, 0x80]);
        device.extend(namestring("OPR2"));
        device.push(0x00);
        device.push(0x0c);
        device.extend(0x2000u32.to_le_bytes());
        device.extend([0x0a, 0x04]);
        let mut field = namestring("OPR2");
        field.push(0x03);
        field.extend(namestring("FLD"));
        field.push(0x20);
        device.extend([0x5b, 0x81]);
        device.extend(pkg(&field));
        table.extend([0x5b, 0x82]);
        table.extend(pkg(&device));

        interpreter.load_table(&table).unwrap();
        interpreter.handler().write_u32(0x2000, 0x1234_5678);

        let package = interpreter.namespace.lock().get(name("\\PKG")).unwrap();
        let element = interpreter.get_pkg_element(&package, 0).unwrap();
        assert_eq!(element.as_integer(), Ok(0x1234_5678));

        // Resolution is idempotent; field elements re-read on each access
        interpreter.handler().write_u32(0x2000, 0x9abc_def0);
        let element = interpreter.get_pkg_element(&package, 0).unwrap();
        assert_eq!(element.as_integer(), Ok(0x9abc_def0));
    }

    #[test]
    fn while_loop_and_break() {
        let interpreter = make_interpreter();
        // Method(MAIN) {
        //     Store(0, Local0)
        //     While(LLess(Local0, 10)) { Increment(Local0); If(LEqual(Local0, 5)) { Break } }
        //     Return(Local0)
        // }
        let mut while_content = vec![0x95, 0x60, 0x0a, 0x0a, 0x75, 0x60];
        let if_content = [0x93, 0x60, 0x0a, 0x05, 0xa5];
        while_content.push(0xa0);
        while_content.extend(pkg(&if_content));

        let mut body = vec![0x70, 0x00, 0x60, 0xa2];
        body.extend(pkg(&while_content));
        body.extend([0xa4, 0x60]);

        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        let result = interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(result.as_integer(), Ok(5));
    }

    #[test]
    fn store_truncates_strings_and_zero_pads_buffers() {
        let interpreter = make_interpreter();

        let mut table = vec![0x08];
        table.extend(namestring("STR1"));
        table.extend([0x0d, b'A', b'A', b'A', b'A', 0x00]);
        table.push(0x08);
        table.extend(namestring("BUF1"));
        table.push(0x11);
        table.extend(pkg(&[0x0a, 0x04, 1, 2, 3, 4]));

        // Method(MAIN) { Store("zz", STR1); Store(Buffer(2) { 9, 9 }, BUF1) }
        let mut body = vec![0x70, 0x0d, b'z', b'z', 0x00];
        body.extend(namestring("STR1"));
        body.extend([0x70, 0x11]);
        body.extend(pkg(&[0x0a, 0x02, 9, 9]));
        body.extend(namestring("BUF1"));
        table.extend(method("MAIN", 0, &body));

        interpreter.load_table(&table).unwrap();
        interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();

        let string = interpreter.namespace.lock().get(name("\\STR1")).unwrap();
        assert_eq!(string.as_string().unwrap(), "zz");
        let buffer = interpreter.namespace.lock().get(name("\\BUF1")).unwrap();
        assert_eq!(buffer.as_buffer().unwrap(), &[9, 9, 0, 0]);
    }

    #[test]
    fn numeric_string_parsing() {
        assert_eq!(parse_numeric_string("0x1A"), 26);
        assert_eq!(parse_numeric_string("  123"), 123);
        assert_eq!(parse_numeric_string("010"), 8);
        assert_eq!(parse_numeric_string("-5"), 5u64.wrapping_neg());
        assert_eq!(parse_numeric_string("12ab"), 12);
        assert_eq!(parse_numeric_string("99999999999999999999999999"), u64::MAX);
        assert_eq!(parse_numeric_string(""), 0);
    }

    #[test]
    fn to_integer_op() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(ToInteger("0x1A")) }
        let body = [0xa4, 0x99, 0x0d, b'0', b'x', b'1', b'A', 0x00, 0x00];
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(26));
    }

    #[test]
    fn bcd_round_trip() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(FromBCD(ToBCD(1234))) }
        let body = [0xa4, 0x5b, 0x28, 0x5b, 0x29, 0x0b, 0xd2, 0x04, 0x00, 0x00];
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(1234));
    }

    #[test]
    fn match_op() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(Match(Package { 1, 4, 9 }, MGE, 5, MTR, 0, 0)) }
        let mut body = vec![0xa4, 0x89, 0x12];
        body.extend(pkg(&[0x03, 0x01, 0x0a, 0x04, 0x0a, 0x09]));
        body.extend([0x04, 0x0a, 0x05, 0x00, 0x00, 0x00]);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(2));
    }

    #[test]
    fn match_no_element_gives_ones() {
        let interpreter = make_interpreter();
        // No element is >= 100, so the result is Ones
        let mut body = vec![0xa4, 0x89, 0x12];
        body.extend(pkg(&[0x02, 0x01, 0x0a, 0x04]));
        body.extend([0x04, 0x0a, 0x64, 0x00, 0x00, 0x00]);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(u64::MAX));
    }

    #[test]
    fn match_start_index_out_of_bounds() {
        let interpreter = make_interpreter();
        let mut body = vec![0xa4, 0x89, 0x12];
        body.extend(pkg(&[0x01, 0x01]));
        body.extend([0x00, 0x00, 0x00, 0x00, 0x0a, 0x05]);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate(name("\\MAIN"), vec![]), Err(AmlError::IndexOutOfBounds));
    }

    #[test]
    fn cond_ref_of() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(CondRefOf(FOO, Local0)) } - FOO does not exist
        let mut body = vec![0xa4, 0x5b, 0x12];
        body.extend(namestring("FOO"));
        body.push(0x60);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(0));

        // With \BAR defined, CondRefOf finds it and returns Ones
        let mut table = vec![0x08];
        table.extend(namestring("BAR"));
        table.extend([0x0a, 0x05]);
        let mut body = vec![0xa4, 0x5b, 0x12];
        body.extend(namestring("BAR"));
        body.push(0x60);
        table.extend(method("MN2", 0, &body));
        interpreter.load_table(&table).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MN2"), vec![]), Ok(u64::MAX));
    }

    #[test]
    fn deref_of_buffer_index() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Store(Index(Buffer { 1, 2, 3 }, 1), Local0); Return(DerefOf(Local0)) }
        let mut body = vec![0x88, 0x11];
        body.extend(pkg(&[0x0a, 0x03, 1, 2, 3]));
        body.extend([0x0a, 0x01, 0x60, 0xa4, 0x83, 0x60]);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(2));
    }

    #[test]
    fn undersized_package_pads_with_uninitialized() {
        let interpreter = make_interpreter();
        // Name(PKG2, Package(3) { 1, 2 })
        let mut table = vec![0x08];
        table.extend(namestring("PKG2"));
        table.push(0x12);
        table.extend(pkg(&[0x03, 0x01, 0x0a, 0x02]));
        // Method(MAIN) { Return(SizeOf(PKG2)) }
        let mut body = vec![0xa4, 0x87];
        body.extend(namestring("PKG2"));
        table.extend(method("MAIN", 0, &body));

        interpreter.load_table(&table).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(3));

        let package = interpreter.namespace.lock().get(name("\\PKG2")).unwrap();
        let element = interpreter.get_pkg_element(&package, 2).unwrap();
        assert_eq!(element.typ(), ObjectType::Uninitialized);
    }

    #[test]
    fn osi_answers_windows_queries() {
        let interpreter = make_interpreter();
        let result = interpreter
            .evaluate(name("\\_OSI"), vec![Object::String("Windows 2015".to_string()).wrap()])
            .unwrap();
        assert_eq!(result.as_integer(), Ok(u64::MAX));

        let result =
            interpreter.evaluate(name("\\_OSI"), vec![Object::String("Linux".to_string()).wrap()]).unwrap();
        assert_eq!(result.as_integer(), Ok(0));
    }

    #[test]
    fn divide_produces_quotient_and_remainder() {
        let interpreter = make_interpreter();
        let mut table = vec![0x08];
        table.extend(namestring("REMN"));
        table.push(0x00);
        table.push(0x08);
        table.extend(namestring("QUOT"));
        table.push(0x00);

        // Method(MAIN) { Divide(7, 2, REMN, QUOT) }
        let mut body = vec![0x78, 0x0a, 0x07, 0x0a, 0x02];
        body.extend(namestring("REMN"));
        body.extend(namestring("QUOT"));
        table.extend(method("MAIN", 0, &body));

        interpreter.load_table(&table).unwrap();
        interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\REMN"), vec![]), Ok(1));
        assert_eq!(interpreter.evaluate_int(name("\\QUOT"), vec![]), Ok(3));
    }

    #[test]
    fn divide_by_zero_errors() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Divide(1, 0, , ) }
        let body = [0x78, 0x0a, 0x01, 0x00, 0x00, 0x00];
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate(name("\\MAIN"), vec![]), Err(AmlError::DivideByZero));
    }

    #[test]
    fn mid_op() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Return(Mid("abcdef", 1, 3)) }
        let mut body = vec![0xa4, 0x9e, 0x0d];
        body.extend(b"abcdef");
        body.extend([0x00, 0x0a, 0x01, 0x0a, 0x03, 0x00]);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        let result = interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(result.as_string().unwrap(), "bcd");
    }

    #[test]
    fn notify_reaches_installed_handler() {
        let interpreter = make_interpreter();

        // Device(DEV2) { }; Method(MAIN) { Notify(\DEV2, 0x80) }
        let mut table = vec![0x5b, 0x82];
        table.extend(pkg(&namestring("DEV2")));
        let mut body = vec![0x86];
        body.extend(namestring("\\DEV2"));
        body.extend([0x0a, 0x80]);
        table.extend(method("MAIN", 0, &body));
        interpreter.load_table(&table).unwrap();

        let received = Arc::new(Spinlock::new(Vec::new()));
        let recorder = received.clone();
        interpreter.install_notify_handler(
            name("\\DEV2"),
            Box::new(move |path, value| recorder.lock().push((path.clone(), value))),
        );

        interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert_eq!(&*received.lock(), &[(name("\\DEV2"), 0x80)]);
    }

    struct EcHandler {
        attached: AtomicBool,
        value: AtomicUsize,
    }

    impl RegionHandler for EcHandler {
        fn attach(&self, _region: &OpRegion) -> Result<(), AmlError> {
            self.attached.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read(&self, _region: &OpRegion, _offset: u64, _width: usize) -> Result<u64, AmlError> {
            Ok(self.value.load(Ordering::SeqCst) as u64)
        }

        fn write(&self, _region: &OpRegion, _offset: u64, _width: usize, value: u64) -> Result<(), AmlError> {
            self.value.store(value as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn region_handler_attach_and_deferred_reg() {
        let interpreter = make_interpreter();

        // Name(REGF, 0xFF)
        let mut table = vec![0x08];
        table.extend(namestring("REGF"));
        table.extend([0x0a, 0xff]);

        // Device(DEVC) {
        //     OperationRegion(EREG, EmbeddedControl, 0, 4)
        //     Field(EREG, ByteAcc, NoLock, Preserve) { ECF1, 8 }
        //     Method(_REG, 2) { Store(Arg1, \REGF) }
        // }
        let mut device = namestring("DEVC");
        device.extend([0x5b, 0x80]);
        device.extend(namestring("EREG"));
        device.extend([0x03, 0x00, 0x0a, 0x04]);
        let mut field = namestring("EREG");
        field.push(0x01);
        field.extend(namestring("ECF1"));
        field.push(0x08);
        device.extend([0x5b, 0x81]);
        device.extend(pkg(&field));
        let mut reg_body = vec![0x70, 0x69];
        reg_body.extend(namestring("\\REGF"));
        device.extend(method("_REG", 0x02, &reg_body));
        table.extend([0x5b, 0x82]);
        table.extend(pkg(&device));

        // Method(MAIN) { Return(\DEVC.ECF1) }
        let mut body = vec![0xa4];
        body.extend(namestring("\\DEVC.ECF1"));
        table.extend(method("MAIN", 0, &body));

        interpreter.load_table(&table).unwrap();

        // No handler yet: `_REG` is deferred
        assert_eq!(interpreter.evaluate_int(name("\\REGF"), vec![]), Ok(0xff));

        let handler = EcHandler { attached: AtomicBool::new(false), value: AtomicUsize::new(0xab) };
        interpreter.install_region_handler(RegionSpace::EmbeddedControl, handler);

        // Installing the handler ran `_REG(3, 1)`
        assert_eq!(interpreter.evaluate_int(name("\\REGF"), vec![]), Ok(1));

        // Reads go through the handler, attaching on first access
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(0xab));
    }

    #[test]
    fn initialize_namespace_runs_ini_for_present_devices() {
        let interpreter = make_interpreter();

        let mut table = vec![0x08];
        table.extend(namestring("FLG1"));
        table.push(0x00);

        // Device(DEVA) { Name(_STA, 0x0F) Method(_INI) { Store(1, \FLG1) } }
        let mut deva = namestring("DEVA");
        deva.push(0x08);
        deva.extend(namestring("_STA"));
        deva.extend([0x0a, 0x0f]);
        let mut ini = vec![0x70, 0x01];
        ini.extend(namestring("\\FLG1"));
        deva.extend(method("_INI", 0, &ini));
        table.extend([0x5b, 0x82]);
        table.extend(pkg(&deva));

        // Device(DEVB) { Name(_STA, 0) Method(_INI) { Store(2, \FLG1) } }
        let mut devb = namestring("DEVB");
        devb.push(0x08);
        devb.extend(namestring("_STA"));
        devb.push(0x00);
        let mut ini = vec![0x70, 0x0a, 0x02];
        ini.extend(namestring("\\FLG1"));
        devb.extend(method("_INI", 0, &ini));
        table.extend([0x5b, 0x82]);
        table.extend(pkg(&devb));

        interpreter.load_table(&table).unwrap();
        interpreter.initialize_namespace().unwrap();

        assert_eq!(interpreter.evaluate_int(name("\\FLG1"), vec![]), Ok(1));
    }

    #[test]
    fn discover_nodes_by_hid_and_cid() {
        let interpreter = make_interpreter();

        // Device(PCI0) { Name(_HID, EisaId("PNP0A03")) }
        let mut pci0 = namestring("PCI0");
        pci0.push(0x08);
        pci0.extend(namestring("_HID"));
        pci0.push(0x0c);
        pci0.extend(0x030a_d041u32.to_le_bytes());
        let mut table = vec![0x5b, 0x82];
        table.extend(pkg(&pci0));

        // Device(COM1) { Name(_HID, "PNP0501") }
        let mut com1 = namestring("COM1");
        com1.push(0x08);
        com1.extend(namestring("_HID"));
        com1.push(0x0d);
        com1.extend(b"PNP0501");
        com1.push(0x00);
        table.extend([0x5b, 0x82]);
        table.extend(pkg(&com1));

        interpreter.load_table(&table).unwrap();

        let mut found = Vec::new();
        interpreter
            .discover_nodes(None, &[DeviceId::Eisa(EisaId(*b"PNP0A03"))], |_, path| {
                found.push(path.clone());
                IterDecision::Continue
            })
            .unwrap();
        assert_eq!(found, vec![name("\\PCI0")]);

        let mut found = Vec::new();
        interpreter
            .discover_nodes(None, &[DeviceId::Str("PNP0501")], |_, path| {
                found.push(path.clone());
                IterDecision::Continue
            })
            .unwrap();
        assert_eq!(found, vec![name("\\COM1")]);
    }

    #[test]
    fn typed_evaluate_variants() {
        let interpreter = make_interpreter();

        let mut table = vec![0x08];
        table.extend(namestring("INT1"));
        table.extend([0x0a, 0x2a]);
        table.push(0x08);
        table.extend(namestring("BUF2"));
        table.push(0x11);
        table.extend(pkg(&[0x0a, 0x02, 0xaa, 0xbb]));
        table.push(0x08);
        table.extend(namestring("PKG3"));
        table.push(0x12);
        table.extend(pkg(&[0x01, 0x01]));
        interpreter.load_table(&table).unwrap();

        assert_eq!(interpreter.evaluate_int(name("\\INT1"), vec![]), Ok(42));
        assert_eq!(interpreter.evaluate_buffer(name("\\BUF2"), vec![]).unwrap().as_buffer().unwrap(), &[
            0xaa, 0xbb
        ]);
        assert!(interpreter.evaluate_package(name("\\PKG3"), vec![]).is_ok());
        assert!(matches!(
            interpreter.evaluate_int(name("\\BUF2"), vec![]),
            Err(AmlError::ObjectNotOfExpectedType { .. })
        ));
    }

    #[test]
    fn method_created_nodes_are_removed_on_return() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Name(TMP, 5) }
        let mut body = vec![0x08];
        body.extend(namestring("TMP"));
        body.extend([0x0a, 0x05]);
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();

        interpreter.evaluate(name("\\MAIN"), vec![]).unwrap();
        assert!(interpreter.namespace.lock().get(name("\\MAIN.TMP")).is_err());
    }

    #[test]
    fn end_of_method_yields_zero() {
        let interpreter = make_interpreter();
        // Method(MAIN) { Noop }
        interpreter.load_table(&method("MAIN", 0, &[0xa3])).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(0));
    }

    #[test]
    fn revision_one_tables_use_32_bit_integers() {
        let interpreter = Interpreter::new(TestHandler::new(), 1);
        // Method(MAIN) { Return(Add(0xFFFFFFFF, 1)) } - wraps at 32 bits
        let body = [0xa4, 0x72, 0x0c, 0xff, 0xff, 0xff, 0xff, 0x01, 0x00];
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(0));

        // Ones is width-dependent too: Method(MN2) { Return(Ones) }
        interpreter.load_table(&method("MN2", 0, &[0xa4, 0xff])).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MN2"), vec![]), Ok(0xffff_ffff));
    }

    #[test]
    fn create_buffer_fields() {
        let interpreter = make_interpreter();
        // Name(BUFX, Buffer(4) { })
        let mut table = vec![0x08];
        table.extend(namestring("BUFX"));
        table.push(0x11);
        table.extend(pkg(&[0x0a, 0x04]));
        // CreateWordField(BUFX, 1, WRD1)
        table.push(0x8b);
        table.extend(namestring("BUFX"));
        table.extend([0x0a, 0x01]);
        table.extend(namestring("WRD1"));
        // Method(MAIN) { Store(0xBEEF, WRD1); Return(WRD1) }
        let mut body = vec![0x70, 0x0b, 0xef, 0xbe];
        body.extend(namestring("WRD1"));
        body.push(0xa4);
        body.extend(namestring("WRD1"));
        table.extend(method("MAIN", 0, &body));

        interpreter.load_table(&table).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(0xbeef));

        let buffer = interpreter.namespace.lock().get(name("\\BUFX")).unwrap();
        assert_eq!(buffer.as_buffer().unwrap(), &[0x00, 0xef, 0xbe, 0x00]);
    }

    #[test]
    fn object_type_op() {
        let interpreter = make_interpreter();
        let mut table = vec![0x08];
        table.extend(namestring("STR2"));
        table.extend([0x0d, b'x', 0x00]);
        // Method(MAIN) { Return(ObjectType(STR2)) }
        let mut body = vec![0xa4, 0x8e];
        body.extend(namestring("STR2"));
        table.extend(method("MAIN", 0, &body));
        interpreter.load_table(&table).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(2));
    }

    #[test]
    fn else_branch_taken_when_predicate_false() {
        let interpreter = make_interpreter();
        // Method(MAIN) { If(0) { Return(1) } Else { Return(2) } }
        let if_content: Vec<u8> = {
            let mut content = vec![0x00];
            content.extend([0xa4, 0x01]);
            content
        };
        let else_content = [0xa4, 0x0a, 0x02];
        let mut body = vec![0xa0];
        body.extend(pkg(&if_content));
        body.push(0xa1);
        body.extend(pkg(&else_content));
        interpreter.load_table(&method("MAIN", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(2));

        // And the then-branch correctly skips the else
        let if_content = [0x01, 0xa4, 0x01];
        let else_content = [0xa4, 0x0a, 0x02];
        let mut body = vec![0xa0];
        body.extend(pkg(&if_content));
        body.push(0xa1);
        body.extend(pkg(&else_content));
        interpreter.load_table(&method("MN2", 0, &body)).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MN2"), vec![]), Ok(1));
    }

    #[test]
    fn load_sdt_validates_and_uses_table_revision() {
        use crate::test_helpers::build_sdt;

        let interpreter = Interpreter::new(TestHandler::new(), 2);
        // A revision-1 SSDT: methods it declares use 32-bit integers
        let table = build_sdt(b"SSDT", 1, &method("MAIN", 0, &[0xa4, 0xff]));
        interpreter.load_sdt(&table).unwrap();
        assert_eq!(interpreter.evaluate_int(name("\\MAIN"), vec![]), Ok(0xffff_ffff));

        let bad = build_sdt(b"APIC", 1, &[]);
        assert_eq!(interpreter.load_sdt(&bad), Err(AmlError::TableInvalidSignature(*b"APIC")));
    }
}
