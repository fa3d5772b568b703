// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! The bridge instance: lifecycle, call dispatch, trampoline and timers.
//!
//! One [`Bridge`] owns everything a guest can reach: the value table, the
//! cached memory view, the pending-call descriptor and the scheduled
//! timeouts. It is exclusively owned by one logical thread of control and is
//! deliberately neither `Send` nor `Sync`; a host with true parallelism must
//! not share an instance across workers.
//!
//! Control flow is strictly cooperative. The guest runs only inside
//! `run`/`resume` and calls host capabilities through
//! [`Bridge::invoke_import`]; host callbacks created for the guest stash a
//! pending-call descriptor and force a resume, which is how a host-side
//! callback appears synchronous to its caller.

use crate::codec::{self, WireValue};
use crate::host::{Clock, FileSystem, ProcessFacade, RandomSource, TimerHandle, TimerScheduler};
use crate::memory::MemoryView;
use crate::module::GuestModule;
use crate::prelude::*;
use crate::table::{Handle, ValueTable};
use crate::value::{reflect_error, reflect_error_from, ArrayObject, DictObject};

/// Fixed base offset of the argument/environment region in guest memory.
pub const ARGS_OFFSET: u64 = 4096;

/// Hard ceiling of the argument/environment region: the guest's own data
/// segment is guaranteed to start no lower than this.
pub const ARGS_LIMIT: u64 = 4096 + 8192;

const NOT_RUNNING: Error = Error::new(
    ErrorCategory::InvalidState,
    codes::BRIDGE_NOT_RUNNING,
    "Bridge is not running",
);

const ALREADY_STARTED: Error = Error::new(
    ErrorCategory::InvalidState,
    codes::BRIDGE_ALREADY_STARTED,
    "Bridge has already been started",
);

const NO_GUEST: Error = Error::new(
    ErrorCategory::InvalidState,
    codes::NO_GUEST_MODULE,
    "No guest module is attached",
);

const ARGS_TOO_LARGE: Error = Error::new(
    ErrorCategory::Capacity,
    codes::ARGS_TOO_LARGE,
    "Total length of command line and environment variables exceeds limit",
);

const IMPORT_NOT_FOUND: Error = Error::new(
    ErrorCategory::Runtime,
    codes::IMPORT_NOT_FOUND,
    "Guest invoked an unknown import",
);

/// Lifecycle of a bridge instance. Monotonic; no state is ever re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet started.
    Created,
    /// Startup in progress (argument marshalling, table seeding).
    Starting,
    /// Guest entry point invoked; host calls are valid.
    Running,
    /// Guest exited; every operation other than observation is rejected.
    Exited,
}

/// Bridge construction options.
#[derive(Clone)]
pub struct BridgeConfig {
    /// When true (the default), guest exit records the code on the process
    /// facade and returns; when false, the process facade's `exit` is
    /// invoked immediately.
    pub return_on_exit: bool,
    /// Optional extra constant value seeded as handle 7. Which constant
    /// handles exist is configuration, not semantics.
    pub shared_value: Option<HostValue>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { return_on_exit: true, shared_value: None }
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("return_on_exit", &self.return_on_exit)
            .field("shared_value", &self.shared_value.is_some())
            .finish()
    }
}

/// The host facades a bridge is constructed over.
pub struct HostEnv {
    /// Filesystem facade for raw guest writes.
    pub fs: Box<dyn FileSystem>,
    /// Process facade for argv, env and exit.
    pub process: Box<dyn ProcessFacade>,
    /// Wall/monotonic clock source.
    pub clock: Box<dyn Clock>,
    /// Random byte source.
    pub random: Box<dyn RandomSource>,
    /// Host timer facility.
    pub scheduler: Box<dyn TimerScheduler>,
}

/// Descriptor of an in-flight host-to-guest callback invocation.
///
/// Created each time a guest-registered function wrapper is invoked from
/// host code; the guest reads it through the bridge value (handle 6), runs
/// the callback, deposits `result` and clears the pending slot before
/// yielding. Exactly one may be outstanding at a time; invoking a second
/// wrapper while one is pending is rejected.
pub struct PendingCall {
    id: i64,
    this_value: HostValue,
    args: Rc<ArrayObject>,
    result: RefCell<HostValue>,
}

impl PendingCall {
    fn new(id: i64, this_value: HostValue, args: Vec<HostValue>) -> Self {
        Self {
            id,
            this_value,
            args: ArrayObject::new(args),
            result: RefCell::new(HostValue::Undefined),
        }
    }

    /// Identifier of the guest-registered function being invoked.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Result deposited by the guest (undefined until then).
    #[must_use]
    pub fn result(&self) -> HostValue {
        self.result.borrow().clone()
    }
}

impl HostObject for PendingCall {
    fn type_name(&self) -> &'static str {
        "pendingCall"
    }

    fn get(&self, _bridge: &mut Bridge, key: &str) -> ReflectResult<HostValue> {
        match key {
            "id" => Ok(HostValue::Number(self.id as f64)),
            "this" => Ok(self.this_value.clone()),
            "args" => Ok(HostValue::Object(self.args.clone())),
            "result" => Ok(self.result()),
            _ => Ok(HostValue::Undefined),
        }
    }

    fn set(&self, _bridge: &mut Bridge, key: &str, value: HostValue) -> ReflectResult<()> {
        match key {
            "result" => {
                *self.result.borrow_mut() = value;
                Ok(())
            }
            _ => Err(reflect_error("pending call fields other than result are read-only")),
        }
    }
}

/// The bridge instance as seen from the guest (reserved handle 6).
///
/// Exposes `_pendingCall` and `_makeFuncWrapper`, the two properties the
/// guest-side runtime needs to dispatch callbacks.
struct BridgeObject;

impl HostObject for BridgeObject {
    fn type_name(&self) -> &'static str {
        "bridge"
    }

    fn get(&self, bridge: &mut Bridge, key: &str) -> ReflectResult<HostValue> {
        match key {
            "_pendingCall" => Ok(bridge
                .pending_call
                .clone()
                .map_or(HostValue::Null, |call| HostValue::Object(call))),
            "_makeFuncWrapper" => Ok(HostValue::Function(HostFunc::new(|bridge, _this, args| {
                let id = args
                    .first()
                    .and_then(HostValue::as_number)
                    .ok_or_else(|| reflect_error("wrapper id must be a number"))?;
                Ok(bridge.make_func_wrapper(id as i64))
            }))),
            _ => Ok(HostValue::Undefined),
        }
    }

    fn set(&self, bridge: &mut Bridge, key: &str, value: HostValue) -> ReflectResult<()> {
        match (key, value) {
            ("_pendingCall", HostValue::Null | HostValue::Undefined) => {
                bridge.pending_call = None;
                Ok(())
            }
            ("_pendingCall", _) => {
                Err(reflect_error("only null may be assigned to _pendingCall"))
            }
            _ => Err(reflect_error("bridge fields are read-only")),
        }
    }
}

/// Host-side bridge runtime for one guest instance.
pub struct Bridge {
    state: LifecycleState,
    config: BridgeConfig,
    guest: Option<Rc<dyn GuestModule>>,
    view: Option<MemoryView>,
    table: Option<ValueTable>,
    global: Rc<DictObject>,
    fs: Box<dyn FileSystem>,
    process: Box<dyn ProcessFacade>,
    clock: Box<dyn Clock>,
    random: Box<dyn RandomSource>,
    scheduler: Box<dyn TimerScheduler>,
    pending_call: Option<Rc<PendingCall>>,
    next_timeout_id: i32,
    scheduled_timeouts: HashMap<i32, TimerHandle>,
    exit_code: Option<i32>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .field("scheduled_timeouts", &self.scheduled_timeouts.len())
            .finish()
    }
}

impl Bridge {
    /// Construct a bridge over the given host environment.
    #[must_use]
    pub fn new(config: BridgeConfig, env: HostEnv) -> Self {
        Self {
            state: LifecycleState::Created,
            config,
            guest: None,
            view: None,
            table: None,
            global: DictObject::new("global"),
            fs: env.fs,
            process: env.process,
            clock: env.clock,
            random: env.random,
            scheduler: env.scheduler,
            pending_call: None,
            next_timeout_id: 1,
            scheduled_timeouts: HashMap::new(),
            exit_code: None,
        }
    }

    /// The global object (reserved handle 5). Embedders register the values
    /// they expose to the guest here before starting.
    #[must_use]
    pub fn global(&self) -> Rc<DictObject> {
        self.global.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Exit code once the guest has exited.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Whether the guest has exited.
    #[must_use]
    pub fn is_exited(&self) -> bool {
        self.state == LifecycleState::Exited
    }

    // ---- startup / shutdown -------------------------------------------------

    /// Start the guest: seed the value table, marshal arguments and
    /// environment into guest memory and invoke the entry point.
    ///
    /// Returns once the guest first yields or exits. Starting twice is a
    /// fatal usage error. The exit code is observed through
    /// [`Bridge::exit_code`] (or the event loop driving the bridge).
    pub fn start(&mut self, guest: Rc<dyn GuestModule>) -> Result<()> {
        if self.state != LifecycleState::Created {
            return Err(ALREADY_STARTED);
        }
        self.state = LifecycleState::Starting;

        let mem = MemoryView::new(guest.memory());
        self.guest = Some(guest.clone());
        self.view = Some(mem.clone());
        self.table = Some(ValueTable::new(
            HostValue::Object(self.global.clone()),
            HostValue::Object(Rc::new(BridgeObject)),
            self.config.shared_value.clone(),
        ));

        let (argc, argv_ptr) = self.write_args_and_env(&mem)?;

        log::debug!("starting guest with argc={argc} argv_ptr={argv_ptr:#x}");
        self.state = LifecycleState::Running;
        guest.run(self, argc, argv_ptr)?;
        Ok(())
    }

    /// Marshal argv and env into the region at [`ARGS_OFFSET`], returning
    /// `(argc, argv_ptr)` for the guest entry point.
    ///
    /// Layout: NUL-terminated argument strings, then NUL-terminated
    /// `KEY=VALUE` strings (sorted by key), each padded to 8-byte
    /// alignment, followed by the pointer array: argv pointers, a zero
    /// terminator, envp pointers, a zero terminator, each pointer stored as
    /// a 32-bit word plus 32 bits of zero padding.
    fn write_args_and_env(&mut self, mem: &MemoryView) -> Result<(i32, u32)> {
        let mut offset = ARGS_OFFSET;
        let mut write_str = |s: &str| -> Result<u64> {
            let ptr = offset;
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            mem.write_bytes(offset, &bytes)?;
            offset += bytes.len() as u64;
            if offset % 8 != 0 {
                offset += 8 - (offset % 8);
            }
            Ok(ptr)
        };

        let args = self.process.argv();
        let argc = args.len() as i32;

        let mut ptrs: Vec<u64> = Vec::new();
        for arg in &args {
            ptrs.push(write_str(arg)?);
        }
        ptrs.push(0);
        for (key, value) in self.process.env() {
            ptrs.push(write_str(&format!("{key}={value}"))?);
        }
        ptrs.push(0);

        let argv_ptr = offset;
        for ptr in &ptrs {
            mem.set_u32(offset, *ptr as u32)?;
            mem.set_u32(offset + 4, 0)?;
            offset += 8;
        }

        // The guest's data segment starts no lower than ARGS_LIMIT; fail
        // before invoking the entry point rather than corrupting it.
        if offset >= ARGS_LIMIT {
            return Err(ARGS_TOO_LARGE);
        }

        Ok((argc, argv_ptr as u32))
    }

    /// Release all bridge-owned state. Unconditional and idempotent for the
    /// single bridge lifetime.
    fn teardown(&mut self) {
        let handles: Vec<TimerHandle> = self.scheduled_timeouts.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.scheduler.cancel(handle);
        }
        self.table = None;
        self.view = None;
        self.pending_call = None;
        self.guest = None;
    }

    // ---- resume / trampoline ------------------------------------------------

    /// Continue guest execution until its next yield point.
    ///
    /// Fatal usage error unless the bridge is running.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != LifecycleState::Running {
            return Err(NOT_RUNNING);
        }
        let guest = self.guest.clone().ok_or(NO_GUEST)?;
        guest.resume(self)
    }

    /// Create a host function value that invokes the guest-registered
    /// function `id` synchronously: it stashes the pending-call descriptor,
    /// forces a resume and returns the result the guest deposited.
    ///
    /// At most one descriptor may be outstanding; invoking a wrapper while
    /// another call is still pending is rejected rather than overwriting
    /// the live descriptor.
    #[must_use]
    pub fn make_func_wrapper(&self, id: i64) -> HostValue {
        HostValue::Function(HostFunc::new(move |bridge, this, args| {
            if bridge.pending_call.is_some() {
                return Err(reflect_error("a pending call is already outstanding"));
            }
            let call = Rc::new(PendingCall::new(id, this, args.to_vec()));
            bridge.pending_call = Some(call.clone());
            bridge.resume().map_err(reflect_error_from)?;
            Ok(call.result())
        }))
    }

    /// Currently outstanding pending call, if any.
    #[must_use]
    pub fn pending_call(&self) -> Option<Rc<PendingCall>> {
        self.pending_call.clone()
    }

    // ---- timers ---------------------------------------------------------------

    /// Deliver a fired timer.
    ///
    /// Resumes the guest, then keeps resuming while the timer id is still
    /// registered: the guest scheduler is known to occasionally drop the
    /// wakeup, and the guest deregisters the id once it has really handled
    /// it. Ids no longer registered (cancelled or already handled) cause no
    /// resume at all.
    pub fn timeout_fired(&mut self, id: i32) -> Result<()> {
        if !self.scheduled_timeouts.contains_key(&id) {
            return Ok(());
        }
        self.resume()?;
        while self.scheduled_timeouts.contains_key(&id) {
            log::warn!("timeout {id}: missed timeout event, retrying resume");
            self.resume()?;
        }
        Ok(())
    }

    /// Number of timeouts currently scheduled.
    #[must_use]
    pub fn scheduled_timeout_count(&self) -> usize {
        self.scheduled_timeouts.len()
    }

    // ---- memory / wire helpers ------------------------------------------------

    fn mem(&mut self) -> Result<MemoryView> {
        if self.view.is_none() {
            let guest = self.guest.clone().ok_or(NO_GUEST)?;
            self.view = Some(MemoryView::new(guest.memory()));
        }
        match &self.view {
            Some(view) => Ok(view.clone()),
            None => Err(NO_GUEST),
        }
    }

    fn table_mut(&mut self) -> Result<&mut ValueTable> {
        self.table.as_mut().ok_or(NOT_RUNNING)
    }

    fn table_ref(&self) -> Result<&ValueTable> {
        self.table.as_ref().ok_or(NOT_RUNNING)
    }

    fn stack_pointer(&self) -> Result<u64> {
        let guest = self.guest.as_ref().ok_or(NO_GUEST)?;
        Ok(u64::from(guest.stack_pointer()))
    }

    /// Decode the 8-byte wire slot at `addr`.
    pub fn load_value(&mut self, addr: u64) -> Result<HostValue> {
        let bits = self.mem()?.get_u64_bits(addr)?;
        let table = self.table_ref()?;
        codec::decode(table, WireValue::from_bits(bits))
    }

    /// Encode `value` into the 8-byte wire slot at `addr`, incrementing the
    /// target handle's reference count exactly once.
    pub fn store_value(&mut self, addr: u64, value: &HostValue) -> Result<()> {
        let wire = codec::encode(self.table_mut()?, value)?;
        self.mem()?.set_u64_bits(addr, wire.to_bits())
    }

    fn load_slice_header(&mut self, addr: u64) -> Result<(u64, usize)> {
        let mem = self.mem()?;
        let ptr = u64::try_from(mem.get_i64(addr)?).map_err(|_| Error::new(
            ErrorCategory::Memory,
            codes::ADDRESS_OVERFLOW,
            "Negative slice pointer",
        ))?;
        let len = usize::try_from(mem.get_i64(addr + 8)?).map_err(|_| Error::new(
            ErrorCategory::Memory,
            codes::ADDRESS_OVERFLOW,
            "Negative slice length",
        ))?;
        Ok((ptr, len))
    }

    fn load_string(&mut self, addr: u64) -> Result<String> {
        let (ptr, len) = self.load_slice_header(addr)?;
        let bytes = self.mem()?.read_bytes(ptr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn load_slice_of_values(&mut self, addr: u64) -> Result<Vec<HostValue>> {
        let (ptr, len) = self.load_slice_header(addr)?;
        let mut values = Vec::with_capacity(len);
        for i in 0..len {
            values.push(self.load_value(ptr + (i as u64) * 8)?);
        }
        Ok(values)
    }

    // ---- reflective operations -------------------------------------------------

    /// Property get on an arbitrary host value.
    pub fn reflect_get(&mut self, value: &HostValue, key: &str) -> ReflectResult<HostValue> {
        match value {
            HostValue::Object(o) => {
                let o = o.clone();
                o.get(self, key)
            }
            HostValue::Bytes(b) => match key {
                "length" | "byteLength" => Ok(HostValue::Number(b.len() as f64)),
                _ => Ok(HostValue::Undefined),
            },
            HostValue::String(s) => match key {
                "length" => Ok(HostValue::Number(s.len() as f64)),
                _ => Ok(HostValue::Undefined),
            },
            HostValue::Undefined | HostValue::Null => {
                Err(reflect_error("cannot read properties of null or undefined"))
            }
            _ => Err(reflect_error("property access is not supported on this value")),
        }
    }

    /// Property set on an arbitrary host value.
    pub fn reflect_set(
        &mut self,
        value: &HostValue,
        key: &str,
        new_value: HostValue,
    ) -> ReflectResult<()> {
        match value {
            HostValue::Object(o) => {
                let o = o.clone();
                o.set(self, key, new_value)
            }
            HostValue::Undefined | HostValue::Null => {
                Err(reflect_error("cannot set properties of null or undefined"))
            }
            _ => Err(reflect_error("property assignment is not supported on this value")),
        }
    }

    /// Property delete on an arbitrary host value.
    pub fn reflect_delete(&mut self, value: &HostValue, key: &str) -> ReflectResult<()> {
        match value {
            HostValue::Object(o) => {
                let o = o.clone();
                o.delete(self, key)
            }
            _ => Err(reflect_error("property deletion is not supported on this value")),
        }
    }

    /// Indexed get on an arbitrary host value.
    pub fn reflect_get_index(&mut self, value: &HostValue, index: i64) -> ReflectResult<HostValue> {
        match value {
            HostValue::Object(o) => {
                let o = o.clone();
                o.get_index(self, index)
            }
            HostValue::Bytes(b) => usize::try_from(index)
                .ok()
                .and_then(|i| b.get(i))
                .map(|byte| HostValue::Number(f64::from(byte)))
                .ok_or_else(|| reflect_error("byte index out of range")),
            _ => Err(reflect_error("indexed access is not supported on this value")),
        }
    }

    /// Indexed set on an arbitrary host value.
    pub fn reflect_set_index(
        &mut self,
        value: &HostValue,
        index: i64,
        new_value: HostValue,
    ) -> ReflectResult<()> {
        match value {
            HostValue::Object(o) => {
                let o = o.clone();
                o.set_index(self, index, new_value)
            }
            HostValue::Bytes(b) => {
                let i = usize::try_from(index)
                    .map_err(|_| reflect_error("byte index out of range"))?;
                let byte = new_value
                    .as_number()
                    .ok_or_else(|| reflect_error("byte arrays store numbers"))?;
                b.with_mut(|bytes| {
                    if i < bytes.len() {
                        bytes[i] = byte as u8;
                        Ok(())
                    } else {
                        Err(reflect_error("byte index out of range"))
                    }
                })
            }
            _ => Err(reflect_error("indexed assignment is not supported on this value")),
        }
    }

    /// Apply a function value with an explicit calling context.
    pub fn reflect_apply(
        &mut self,
        func: &HostValue,
        this: HostValue,
        args: &[HostValue],
    ) -> ReflectResult<HostValue> {
        match func {
            HostValue::Function(f) => f.call(self, this, args),
            _ => Err(reflect_error("value is not a function")),
        }
    }

    /// Constructor call on a host value.
    pub fn reflect_construct(
        &mut self,
        value: &HostValue,
        args: &[HostValue],
    ) -> ReflectResult<HostValue> {
        match value {
            HostValue::Object(o) => {
                let o = o.clone();
                o.construct(self, args)
            }
            _ => Err(reflect_error("value is not a constructor")),
        }
    }

    /// Structural instance-of test.
    #[must_use]
    pub fn reflect_instance_of(&self, value: &HostValue, constructor: &HostValue) -> bool {
        match value {
            HostValue::Object(o) => o.instance_of(constructor),
            _ => false,
        }
    }

    /// Element count of a host value.
    pub fn reflect_length(&self, value: &HostValue) -> ReflectResult<i64> {
        match value {
            HostValue::String(s) => Ok(s.len() as i64),
            HostValue::Bytes(b) => Ok(b.len() as i64),
            HostValue::Object(o) => o.length(),
            _ => Err(reflect_error("this value has no length")),
        }
    }

    // ---- import dispatch --------------------------------------------------------

    /// Entry point for every host capability the guest invokes.
    ///
    /// `sp` is the guest's stack pointer; each operation reads its
    /// arguments from a fixed layout relative to it. Valid only while the
    /// bridge is running.
    pub fn invoke_import(&mut self, name: &str, sp: u32) -> Result<()> {
        if self.state != LifecycleState::Running {
            return Err(NOT_RUNNING);
        }
        let sp = u64::from(sp);
        match name {
            "runtime.exit" => self.op_exit(sp),
            "runtime.write" => self.op_write(sp),
            "runtime.resetMemoryView" => self.op_reset_memory_view(),
            "runtime.nanotime" => self.op_nanotime(sp),
            "runtime.walltime" => self.op_walltime(sp),
            "runtime.scheduleTimeout" => self.op_schedule_timeout(sp),
            "runtime.clearTimeout" => self.op_clear_timeout(sp),
            "runtime.getRandomData" => self.op_get_random_data(sp),
            "values.finalizeRef" => self.op_finalize_ref(sp),
            "values.stringVal" => self.op_string_val(sp),
            "values.get" => self.op_value_get(sp),
            "values.set" => self.op_value_set(sp),
            "values.delete" => self.op_value_delete(sp),
            "values.index" => self.op_value_index(sp),
            "values.setIndex" => self.op_value_set_index(sp),
            "values.call" => self.op_value_call(sp),
            "values.invoke" => self.op_value_invoke(sp),
            "values.new" => self.op_value_new(sp),
            "values.length" => self.op_value_length(sp),
            "values.prepareString" => self.op_prepare_string(sp),
            "values.loadString" => self.op_load_string(sp),
            "values.instanceOf" => self.op_instance_of(sp),
            "values.copyBytesToGuest" => self.op_copy_bytes_to_guest(sp),
            "values.copyBytesFromGuest" => self.op_copy_bytes_from_guest(sp),
            "debug" => {
                log::debug!("guest debug: sp={sp:#x}");
                Ok(())
            }
            other => {
                log::error!("guest invoked unknown import {other:?}");
                Err(IMPORT_NOT_FOUND)
            }
        }
    }

    // ---- runtime operations -------------------------------------------------

    fn op_exit(&mut self, sp: u64) -> Result<()> {
        let code = self.mem()?.get_i32(sp + 8)?;
        log::debug!("guest exit with code {code}");
        if self.config.return_on_exit {
            self.process.set_exit_code(code);
        } else {
            self.process.exit(code);
        }
        self.state = LifecycleState::Exited;
        self.exit_code = Some(code);
        self.teardown();
        Ok(())
    }

    fn op_write(&mut self, sp: u64) -> Result<()> {
        let mem = self.mem()?;
        let fd = mem.get_i64(sp + 8)?;
        let ptr = u64::try_from(mem.get_i64(sp + 16)?).map_err(|_| Error::new(
            ErrorCategory::Memory,
            codes::ADDRESS_OVERFLOW,
            "Negative write pointer",
        ))?;
        let len = usize::try_from(mem.get_i32(sp + 24)?.max(0)).unwrap_or(0);
        let bytes = mem.read_bytes(ptr, len)?;
        self.fs.write_sync(fd, &bytes)?;
        Ok(())
    }

    fn op_reset_memory_view(&mut self) -> Result<()> {
        // Guest memory was reallocated; rebuild the view on next access.
        self.view = None;
        Ok(())
    }

    fn op_nanotime(&mut self, sp: u64) -> Result<()> {
        let now = self.clock.monotonic_nanos();
        self.mem()?.set_i64(sp + 8, now)
    }

    fn op_walltime(&mut self, sp: u64) -> Result<()> {
        let (sec, nsec) = self.clock.wall_time();
        let mem = self.mem()?;
        mem.set_i64(sp + 8, sec)?;
        mem.set_i32(sp + 16, nsec)
    }

    fn op_schedule_timeout(&mut self, sp: u64) -> Result<()> {
        let delay_ns = self.mem()?.get_i64(sp + 8)?.max(0) as u64;
        let id = self.next_timeout_id;
        self.next_timeout_id += 1;
        let handle = self.scheduler.schedule(Duration::from_nanos(delay_ns), id);
        self.scheduled_timeouts.insert(id, handle);
        log::trace!("scheduled timeout {id} for {delay_ns}ns");
        self.mem()?.set_i32(sp + 16, id)
    }

    fn op_clear_timeout(&mut self, sp: u64) -> Result<()> {
        let id = self.mem()?.get_i32(sp + 8)?;
        if let Some(handle) = self.scheduled_timeouts.remove(&id) {
            self.scheduler.cancel(handle);
        }
        Ok(())
    }

    fn op_get_random_data(&mut self, sp: u64) -> Result<()> {
        let (ptr, len) = self.load_slice_header(sp + 8)?;
        let mem = self.mem()?;
        // Validate the destination before allocating a host buffer from a
        // guest-supplied length.
        let end = ptr.checked_add(len as u64).ok_or(Error::new(
            ErrorCategory::Memory,
            codes::ADDRESS_OVERFLOW,
            "Guest memory address arithmetic overflowed",
        ))?;
        if end > mem.len() as u64 {
            return Err(kinds::memory_out_of_bounds_error(
                "Random data destination out of bounds",
            ));
        }
        let mut buf = vec![0u8; len];
        self.random.fill(&mut buf)?;
        mem.write_bytes(ptr, &buf)
    }

    // ---- value operations -----------------------------------------------------

    fn op_finalize_ref(&mut self, sp: u64) -> Result<()> {
        let handle: Handle = self.mem()?.get_u32(sp + 8)?;
        self.table_mut()?.release(handle)
    }

    fn op_string_val(&mut self, sp: u64) -> Result<()> {
        let s = self.load_string(sp + 8)?;
        self.store_value(sp + 24, &HostValue::String(Rc::from(s)))
    }

    fn op_value_get(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let key = self.load_string(sp + 16)?;
        let result = self.reflect_get(&v, &key).map_err(fatal_reflect)?;
        // The getter may have run guest code; the stack may have moved.
        let sp = self.stack_pointer()?;
        self.store_value(sp + 32, &result)
    }

    fn op_value_set(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let key = self.load_string(sp + 16)?;
        let x = self.load_value(sp + 32)?;
        self.reflect_set(&v, &key, x).map_err(fatal_reflect)
    }

    fn op_value_delete(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let key = self.load_string(sp + 16)?;
        self.reflect_delete(&v, &key).map_err(fatal_reflect)
    }

    fn op_value_index(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let index = self.mem()?.get_i64(sp + 16)?;
        let result = self.reflect_get_index(&v, index).map_err(fatal_reflect)?;
        self.store_value(sp + 24, &result)
    }

    fn op_value_set_index(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let index = self.mem()?.get_i64(sp + 16)?;
        let x = self.load_value(sp + 24)?;
        self.reflect_set_index(&v, index, x).map_err(fatal_reflect)
    }

    fn op_value_call(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let method = self.load_string(sp + 16)?;
        let args = self.load_slice_of_values(sp + 32)?;
        let outcome = self
            .reflect_get(&v, &method)
            .and_then(|f| self.reflect_apply(&f, v.clone(), &args));
        // The call may have re-entered the guest and moved the stack.
        let sp = self.stack_pointer()?;
        self.write_call_outcome(sp + 56, sp + 64, outcome)
    }

    fn op_value_invoke(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let args = self.load_slice_of_values(sp + 16)?;
        let outcome = self.reflect_apply(&v, HostValue::Undefined, &args);
        let sp = self.stack_pointer()?;
        self.write_call_outcome(sp + 40, sp + 48, outcome)
    }

    fn op_value_new(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let args = self.load_slice_of_values(sp + 16)?;
        let outcome = self.reflect_construct(&v, &args);
        let sp = self.stack_pointer()?;
        self.write_call_outcome(sp + 40, sp + 48, outcome)
    }

    /// Error boundary shared by call/invoke/new: a reflective fault becomes
    /// an ordinary decoded value plus `success = 0`, never a native error.
    fn write_call_outcome(
        &mut self,
        result_addr: u64,
        flag_addr: u64,
        outcome: ReflectResult<HostValue>,
    ) -> Result<()> {
        match outcome {
            Ok(result) => {
                self.store_value(result_addr, &result)?;
                self.mem()?.set_u8(flag_addr, 1)
            }
            Err(err) => {
                self.store_value(result_addr, &err)?;
                self.mem()?.set_u8(flag_addr, 0)
            }
        }
    }

    fn op_value_length(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let len = self.reflect_length(&v).map_err(fatal_reflect)?;
        self.mem()?.set_i64(sp + 16, len)
    }

    fn op_prepare_string(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let encoded = crate::value::BytesValue::new(v.to_display_string().into_bytes());
        let len = encoded.len() as i64;
        self.store_value(sp + 16, &HostValue::Bytes(encoded))?;
        self.mem()?.set_i64(sp + 24, len)
    }

    fn op_load_string(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let HostValue::Bytes(bytes) = v else {
            return Err(kinds::guest_fault_error("loadString expects a prepared byte value"));
        };
        let (ptr, len) = self.load_slice_header(sp + 16)?;
        let src = bytes.to_vec();
        if src.len() > len {
            return Err(kinds::memory_out_of_bounds_error(
                "Destination slice is shorter than the prepared string",
            ));
        }
        self.mem()?.write_bytes(ptr, &src)
    }

    fn op_instance_of(&mut self, sp: u64) -> Result<()> {
        let v = self.load_value(sp + 8)?;
        let t = self.load_value(sp + 16)?;
        let is = self.reflect_instance_of(&v, &t);
        self.mem()?.set_u8(sp + 24, u8::from(is))
    }

    fn op_copy_bytes_to_guest(&mut self, sp: u64) -> Result<()> {
        let (dst_ptr, dst_len) = self.load_slice_header(sp + 8)?;
        let src = self.load_value(sp + 32)?;
        let HostValue::Bytes(src) = src else {
            return self.mem()?.set_u8(sp + 48, 0);
        };
        let bytes = src.to_vec();
        let n = bytes.len().min(dst_len);
        let mem = self.mem()?;
        mem.write_bytes(dst_ptr, &bytes[..n])?;
        mem.set_i64(sp + 40, n as i64)?;
        mem.set_u8(sp + 48, 1)
    }

    fn op_copy_bytes_from_guest(&mut self, sp: u64) -> Result<()> {
        let dst = self.load_value(sp + 8)?;
        let HostValue::Bytes(dst) = dst else {
            return self.mem()?.set_u8(sp + 48, 0);
        };
        let (src_ptr, src_len) = self.load_slice_header(sp + 16)?;
        let n = src_len.min(dst.len());
        let bytes = self.mem()?.read_bytes(src_ptr, n)?;
        let copied = dst.write_prefix(&bytes);
        let mem = self.mem()?;
        mem.set_i64(sp + 40, copied as i64)?;
        mem.set_u8(sp + 48, 1)
    }
}

/// A reflective failure outside an error boundary is a guest fault: log the
/// error value and surface a protocol error.
fn fatal_reflect(err: HostValue) -> Error {
    log::error!("reflective operation failed: {}", err.to_display_string());
    kinds::guest_fault_error("Reflective host operation failed")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::event_loop::ManualScheduler;
    use crate::host::{StdProcess, SystemClock};
    use crate::memory::{new_shared_memory, SharedMemory};

    struct NoopGuest {
        memory: SharedMemory,
    }

    impl NoopGuest {
        fn new() -> Rc<Self> {
            Rc::new(Self { memory: new_shared_memory(1 << 16) })
        }
    }

    impl GuestModule for NoopGuest {
        fn memory(&self) -> SharedMemory {
            self.memory.clone()
        }

        fn run(&self, _host: &mut Bridge, _argc: i32, _argv_ptr: u32) -> Result<()> {
            Ok(())
        }

        fn stack_pointer(&self) -> u32 {
            0x2000
        }

        fn resume(&self, _host: &mut Bridge) -> Result<()> {
            Ok(())
        }
    }

    struct NullFs;
    impl FileSystem for NullFs {
        fn write_sync(&mut self, _fd: i64, bytes: &[u8]) -> Result<usize> {
            Ok(bytes.len())
        }
    }

    struct NoRandom;
    impl RandomSource for NoRandom {
        fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
            buf.fill(0xAA);
            Ok(())
        }
    }

    fn bridge() -> Bridge {
        Bridge::new(
            BridgeConfig::default(),
            HostEnv {
                fs: Box::new(NullFs),
                process: Box::new(StdProcess::new(
                    vec!["prog".to_string()],
                    BTreeMap::new(),
                )),
                clock: Box::new(SystemClock::new()),
                random: Box::new(NoRandom),
                scheduler: Box::new(ManualScheduler::new()),
            },
        )
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let mut b = bridge();
        assert_eq!(b.state(), LifecycleState::Created);

        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();
        assert_eq!(b.state(), LifecycleState::Running);

        // Starting twice is a fatal usage error.
        let err = b.start(guest).unwrap_err();
        assert_eq!(err.code, codes::BRIDGE_ALREADY_STARTED);
    }

    #[test]
    fn resume_before_start_is_rejected() {
        let mut b = bridge();
        let err = b.resume().unwrap_err();
        assert_eq!(err.code, codes::BRIDGE_NOT_RUNNING);
    }

    #[test]
    fn exit_tears_down_and_rejects_further_calls() {
        let mut b = bridge();
        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();

        // Guest-initiated exit with code 7 written at sp+8.
        let sp = guest.stack_pointer();
        MemoryView::new(guest.memory()).set_i32(u64::from(sp) + 8, 7).unwrap();
        b.invoke_import("runtime.exit", sp).unwrap();

        assert_eq!(b.state(), LifecycleState::Exited);
        assert_eq!(b.exit_code(), Some(7));

        let err = b.resume().unwrap_err();
        assert!(err.is_lifecycle_error());
        let err = b.invoke_import("values.get", sp).unwrap_err();
        assert_eq!(err.code, codes::BRIDGE_NOT_RUNNING);
    }

    #[test]
    fn unknown_import_is_an_error() {
        let mut b = bridge();
        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();
        let err = b.invoke_import("values.nope", guest.stack_pointer()).unwrap_err();
        assert_eq!(err.code, codes::IMPORT_NOT_FOUND);
    }

    #[test]
    fn args_and_env_are_marshalled() {
        let mut b = Bridge::new(
            BridgeConfig::default(),
            HostEnv {
                fs: Box::new(NullFs),
                process: Box::new(StdProcess::new(
                    vec!["prog".to_string(), "--flag".to_string()],
                    BTreeMap::from([("X".to_string(), "1".to_string())]),
                )),
                clock: Box::new(SystemClock::new()),
                random: Box::new(NoRandom),
                scheduler: Box::new(ManualScheduler::new()),
            },
        );
        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();

        let mem = MemoryView::new(guest.memory());
        // First string lands at the fixed base offset, NUL-terminated.
        assert_eq!(mem.read_bytes(ARGS_OFFSET, 5).unwrap(), b"prog\0");
        // Strings are 8-byte aligned: "--flag\0" starts at the next slot.
        assert_eq!(mem.read_bytes(ARGS_OFFSET + 8, 7).unwrap(), b"--flag\0");
        assert_eq!(mem.read_bytes(ARGS_OFFSET + 16, 4).unwrap(), b"X=1\0");

        // Pointer array: argv0, argv1, 0, env0, 0 (u32 + zero pad each).
        let argv_ptr = ARGS_OFFSET + 24;
        assert_eq!(mem.get_u32(argv_ptr).unwrap() as u64, ARGS_OFFSET);
        assert_eq!(mem.get_u32(argv_ptr + 8).unwrap() as u64, ARGS_OFFSET + 8);
        assert_eq!(mem.get_u32(argv_ptr + 16).unwrap(), 0);
        assert_eq!(mem.get_u32(argv_ptr + 24).unwrap() as u64, ARGS_OFFSET + 16);
        assert_eq!(mem.get_u32(argv_ptr + 32).unwrap(), 0);
        // High halves of the pointers are zero.
        assert_eq!(mem.get_u32(argv_ptr + 4).unwrap(), 0);
    }

    #[test]
    fn oversized_args_fail_before_entry() {
        let big = "x".repeat(9000);
        let mut b = Bridge::new(
            BridgeConfig::default(),
            HostEnv {
                fs: Box::new(NullFs),
                process: Box::new(StdProcess::new(vec![big], BTreeMap::new())),
                clock: Box::new(SystemClock::new()),
                random: Box::new(NoRandom),
                scheduler: Box::new(ManualScheduler::new()),
            },
        );
        let err = b.start(NoopGuest::new()).unwrap_err();
        assert!(err.is_capacity_error());
    }

    #[test]
    fn cancelled_timeout_causes_no_resume() {
        let mut b = bridge();
        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();

        let sp = u64::from(guest.stack_pointer());
        let mem = MemoryView::new(guest.memory());
        mem.set_i64(sp + 8, 5_000_000).unwrap();
        b.invoke_import("runtime.scheduleTimeout", sp as u32).unwrap();
        let id = mem.get_i32(sp + 16).unwrap();
        assert_eq!(b.scheduled_timeout_count(), 1);

        mem.set_i32(sp + 8, id).unwrap();
        b.invoke_import("runtime.clearTimeout", sp as u32).unwrap();
        assert_eq!(b.scheduled_timeout_count(), 0);

        // A late fire of the cancelled id must not resume the guest.
        b.timeout_fired(id).unwrap();
    }

    #[test]
    fn second_pending_call_while_one_is_outstanding_is_rejected() {
        let mut b = bridge();
        b.start(NoopGuest::new()).unwrap();

        let first = b.make_func_wrapper(1);
        let second = b.make_func_wrapper(2);

        // NoopGuest never services the descriptor, so it stays outstanding
        // after the resume returns.
        b.reflect_apply(&first, HostValue::Undefined, &[]).unwrap();
        assert_eq!(b.pending_call().unwrap().id(), 1);

        let err = b.reflect_apply(&second, HostValue::Undefined, &[]).unwrap_err();
        let message = b.reflect_get(&err, "message").unwrap();
        assert_eq!(message.as_str(), Some("a pending call is already outstanding"));
        // The live descriptor is untouched.
        assert_eq!(b.pending_call().unwrap().id(), 1);
    }

    #[test]
    fn random_data_with_a_garbage_length_is_rejected_before_allocating() {
        let mut b = bridge();
        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();

        let sp = u64::from(guest.stack_pointer());
        let mem = MemoryView::new(guest.memory());
        mem.set_i64(sp + 8, 0x100).unwrap();
        mem.set_i64(sp + 16, i64::MAX / 2).unwrap();
        let err = b.invoke_import("runtime.getRandomData", sp as u32).unwrap_err();
        assert!(err.is_memory_error());

        // Pointer + length overflow is rejected the same way.
        mem.set_i64(sp + 8, i64::MAX).unwrap();
        mem.set_i64(sp + 16, i64::MAX).unwrap();
        let err = b.invoke_import("runtime.getRandomData", sp as u32).unwrap_err();
        assert!(err.is_memory_error());
    }

    #[test]
    fn clearing_an_unknown_timeout_is_a_noop() {
        let mut b = bridge();
        let guest = NoopGuest::new();
        b.start(guest.clone()).unwrap();
        let sp = u64::from(guest.stack_pointer());
        MemoryView::new(guest.memory()).set_i32(sp + 8, 42).unwrap();
        b.invoke_import("runtime.clearTimeout", sp as u32).unwrap();
    }
}
