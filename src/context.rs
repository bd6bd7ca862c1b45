//! Operation options and per-operation state.
//!
//! [`Context`] is an immutable record updated functionally with `with_*`
//! methods; one is attached to every serialize/deserialize call. The
//! mutable things an operation accumulates — the live depth budget,
//! reference trackers, the string intern pool — live in [`OpContext`],
//! created when the operation starts and recycled when it ends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use educe::Educe;

use crate::error::{Error, Result};
use crate::value::{Literal, Record};

/// A cooperative cancellation signal. Clones share the signal; once
/// canceled, every operation holding the token fails with
/// [`Error::Canceled`] at its next depth-step or refill boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Reference-preservation mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PreserveReferences {
    /// Repeated references are re-serialized structurally; cycles hang the
    /// caller's data model, not this library, and are their problem to
    /// avoid.
    #[default]
    Off,
    /// Deduplicate repeated references; fail on cycles.
    RejectCycles,
    /// Deduplicate repeated references; resolve cycles through early slot
    /// registration.
    AllowCycles,
}

/// Which properties still serialize when they hold their default value.
/// Required constructor parameters always serialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmitDefaults(u8);

impl EmitDefaults {
    pub const NEVER: EmitDefaults = EmitDefaults(0);
    pub const VALUE_TYPES: EmitDefaults = EmitDefaults(1);
    pub const REFERENCE_TYPES: EmitDefaults = EmitDefaults(2);
    pub const ALWAYS: EmitDefaults = EmitDefaults(3);

    pub fn contains(self, other: EmitDefaults) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for EmitDefaults {
    fn default() -> Self {
        EmitDefaults::ALWAYS
    }
}

impl BitOr for EmitDefaults {
    type Output = EmitDefaults;
    fn bitor(self, rhs: Self) -> Self {
        EmitDefaults(self.0 | rhs.0)
    }
}

/// Leniency bits applied while decoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeDefaults(u8);

impl DecodeDefaults {
    pub const STRICT: DecodeDefaults = DecodeDefaults(0);
    /// Accept nil for non-nullable constructor parameters.
    pub const ALLOW_NULL_FOR_NON_NULLABLE: DecodeDefaults = DecodeDefaults(1);
    /// Accept payloads missing required parameters; the slots stay at their
    /// defaults.
    pub const ALLOW_MISSING_REQUIRED: DecodeDefaults = DecodeDefaults(2);

    pub fn contains(self, other: DecodeDefaults) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DecodeDefaults {
    type Output = DecodeDefaults;
    fn bitor(self, rhs: Self) -> Self {
        DecodeDefaults(self.0 | rhs.0)
    }
}

/// Wire layout for sequences of rank above one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MultiDimFormat {
    /// Arrays of arrays.
    #[default]
    Nested,
    /// One array: the dimension lengths, then every element in row-major
    /// order.
    Flat,
}

/// A property-name transform applied when converters are built. The
/// transform itself is supplied by the caller; this wrapper gives it an
/// identity so converter memoization can key on it.
#[derive(Clone)]
pub struct NamingPolicy {
    name: &'static str,
    transform: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

impl NamingPolicy {
    pub fn new(
        name: &'static str,
        transform: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            transform: Arc::new(transform),
        }
    }

    pub fn apply(&self, property: &str) -> String {
        (self.transform)(property)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.transform) as *const () as usize
    }
}

impl fmt::Debug for NamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NamingPolicy({})", self.name)
    }
}

/// Per-operation options. Immutable; every `with_*` call returns an updated
/// copy.
#[derive(Clone, Debug, Educe)]
#[educe(Default)]
pub struct Context {
    #[educe(Default = 64)]
    max_depth: u32,
    #[educe(Default = 65536)]
    unflushed_bytes_threshold: usize,
    cancel: CancelToken,
    preserve_references: PreserveReferences,
    intern_strings: bool,
    serialize_default_values: EmitDefaults,
    deserialize_default_values: DecodeDefaults,
    serialize_enum_values_by_name: bool,
    multi_dimensional_array_format: MultiDimFormat,
    property_naming_policy: Option<NamingPolicy>,
    state: BTreeMap<String, Literal>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn unflushed_bytes_threshold(&self) -> usize {
        self.unflushed_bytes_threshold
    }

    pub fn with_unflushed_bytes_threshold(mut self, threshold: usize) -> Self {
        self.unflushed_bytes_threshold = threshold;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn preserve_references(&self) -> PreserveReferences {
        self.preserve_references
    }

    pub fn with_preserve_references(mut self, mode: PreserveReferences) -> Self {
        self.preserve_references = mode;
        self
    }

    pub fn intern_strings(&self) -> bool {
        self.intern_strings
    }

    pub fn with_intern_strings(mut self, intern: bool) -> Self {
        self.intern_strings = intern;
        self
    }

    pub fn serialize_default_values(&self) -> EmitDefaults {
        self.serialize_default_values
    }

    pub fn with_serialize_default_values(mut self, emit: EmitDefaults) -> Self {
        self.serialize_default_values = emit;
        self
    }

    pub fn deserialize_default_values(&self) -> DecodeDefaults {
        self.deserialize_default_values
    }

    pub fn with_deserialize_default_values(mut self, decode: DecodeDefaults) -> Self {
        self.deserialize_default_values = decode;
        self
    }

    pub fn serialize_enum_values_by_name(&self) -> bool {
        self.serialize_enum_values_by_name
    }

    pub fn with_serialize_enum_values_by_name(mut self, by_name: bool) -> Self {
        self.serialize_enum_values_by_name = by_name;
        self
    }

    pub fn multi_dimensional_array_format(&self) -> MultiDimFormat {
        self.multi_dimensional_array_format
    }

    pub fn with_multi_dimensional_array_format(mut self, format: MultiDimFormat) -> Self {
        self.multi_dimensional_array_format = format;
        self
    }

    pub fn property_naming_policy(&self) -> Option<&NamingPolicy> {
        self.property_naming_policy.as_ref()
    }

    pub fn with_property_naming_policy(mut self, policy: NamingPolicy) -> Self {
        self.property_naming_policy = Some(policy);
        self
    }

    /// User key/value pairs carried through the operation.
    pub fn state(&self) -> &BTreeMap<String, Literal> {
        &self.state
    }

    pub fn with_state(mut self, key: &str, value: Literal) -> Self {
        self.state.insert(key.to_string(), value);
        self
    }

    /// The options that change what a built converter looks like. Converter
    /// memoization keys on this alongside the shape.
    pub(crate) fn member_influence(&self) -> MemberInfluence {
        MemberInfluence {
            naming: self
                .property_naming_policy
                .as_ref()
                .map(|p| p.identity())
                .unwrap_or(0),
            enum_by_name: self.serialize_enum_values_by_name,
            intern: self.intern_strings,
            flat_arrays: self.multi_dimensional_array_format == MultiDimFormat::Flat,
        }
    }
}

/// Build-relevant option fingerprint; part of the converter memo key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct MemberInfluence {
    pub naming: usize,
    pub enum_by_name: bool,
    pub intern: bool,
    pub flat_arrays: bool,
}

/// Write-side record of an object already seen this operation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SeenRef {
    pub id: u64,
    /// False while the object's own write is still on the stack.
    pub complete: bool,
}

/// Identity tracker for the write side: object pointer → reference id.
#[derive(Debug, Default)]
pub(crate) struct WriteRefs {
    map: HashMap<usize, SeenRef>,
    next: u64,
}

impl WriteRefs {
    /// Look up an object; `None` means it hasn't been written yet.
    pub fn seen(&self, ptr: usize) -> Option<SeenRef> {
        self.map.get(&ptr).copied()
    }

    /// Assign the next id to a new object, marked in-progress.
    pub fn begin(&mut self, ptr: usize) -> u64 {
        let id = self.next;
        self.next += 1;
        self.map.insert(
            ptr,
            SeenRef {
                id,
                complete: false,
            },
        );
        id
    }

    /// Mark an object's write finished.
    pub fn finish(&mut self, ptr: usize) {
        if let Some(entry) = self.map.get_mut(&ptr) {
            entry.complete = true;
        }
    }

    fn reset(&mut self) {
        self.map.clear();
        self.next = 0;
    }
}

/// Read-side tracker: reference id → decoded record, dense by id. Slots are
/// reserved before their record finishes decoding so self-references can
/// resolve mid-decode.
#[derive(Debug, Default)]
pub(crate) struct ReadRefs {
    slots: Vec<Option<Record>>,
}

impl ReadRefs {
    /// Reserve the next id.
    pub fn reserve(&mut self) -> u64 {
        self.slots.push(None);
        (self.slots.len() - 1) as u64
    }

    /// Register the record for a reserved slot. With cycles allowed this
    /// happens as soon as the instance exists, before its fields decode.
    pub fn fill(&mut self, id: u64, record: Record) {
        self.slots[id as usize] = Some(record);
    }

    /// Resolve a backreference.
    pub fn get(&self, id: u64, reject_cycles: bool) -> Result<Record> {
        match self.slots.get(id as usize) {
            Some(Some(record)) => Ok(record.clone()),
            Some(None) if reject_cycles => Err(Error::CycleDetected),
            Some(None) => Err(Error::BadData(format!(
                "backreference {} points at an object still being decoded",
                id
            ))),
            None => Err(Error::BadData(format!(
                "backreference {} was never assigned",
                id
            ))),
        }
    }
}

/// Live state for one serialize or deserialize call.
pub struct OpContext {
    cfg: Context,
    depth_left: u32,
    pub(crate) write_refs: WriteRefs,
    pub(crate) read_refs: ReadRefs,
    /// Slot reserved by the reference layer, waiting for the object
    /// converter to report its instance.
    pub(crate) pending_slot: Option<u64>,
    interned: HashSet<Arc<str>>,
}

impl OpContext {
    pub fn new(cfg: Context) -> Self {
        Self::with_tracker(cfg, WriteRefs::default())
    }

    /// Build an operation around a recycled write-side tracker.
    pub(crate) fn with_tracker(cfg: Context, write_refs: WriteRefs) -> Self {
        let depth_left = cfg.max_depth();
        Self {
            cfg,
            depth_left,
            write_refs,
            read_refs: ReadRefs::default(),
            pending_slot: None,
            interned: HashSet::new(),
        }
    }

    /// Tear down, handing the (cleared) write tracker back for pooling.
    pub(crate) fn into_tracker(mut self) -> WriteRefs {
        self.write_refs.reset();
        self.write_refs
    }

    /// The options this operation runs under.
    pub fn config(&self) -> &Context {
        &self.cfg
    }

    /// Fail fast once the cancellation signal trips.
    pub fn check_cancel(&self) -> Result<()> {
        if self.cfg.cancel_token().is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Enter one nesting level: the cancellation and depth-budget step
    /// taken at every object, array, and map boundary.
    pub fn enter(&mut self) -> Result<()> {
        self.check_cancel()?;
        if self.depth_left == 0 {
            return Err(Error::DepthExceeded);
        }
        self.depth_left -= 1;
        Ok(())
    }

    /// Leave a nesting level entered with [`enter`][Self::enter].
    pub fn exit(&mut self) {
        debug_assert!(self.depth_left < self.cfg.max_depth());
        self.depth_left += 1;
    }

    /// Report a freshly constructed object instance. When the reference
    /// layer reserved a slot for it, the slot fills immediately — before
    /// the instance's fields finish decoding — so backreferences into a
    /// cycle resolve mid-decode.
    pub fn report_constructed(&mut self, record: &Record) {
        if let Some(id) = self.pending_slot.take() {
            self.read_refs.fill(id, record.clone());
        }
    }

    /// Dedup a decoded string against the operation's intern pool.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.interned.get(s) {
            return existing.clone();
        }
        let fresh: Arc<str> = Arc::from(s);
        self.interned.insert(fresh.clone());
        fresh
    }

}
