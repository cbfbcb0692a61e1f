//! Shared state store for a single run
//!
//! Bindings live in an explicit stack of scope frames. The outermost frame
//! is the flow scope; it also holds the `state` object and the `step`
//! object through which step outputs are addressed as `step.<id>.output`.
//! Lookups walk the stack innermost-first.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use crate::CoreError;

/// Flow-scope binding holding flow-wide `state.*` fields
pub const STATE_BINDING: &str = "state";

/// Flow-scope binding holding step outputs
pub const STEP_BINDING: &str = "step";

/// Kind of a scope frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Outermost frame holding flow inputs
    Flow,
    /// Frame for a step body (`let` bindings)
    Step,
    /// Frame rebound on every loop iteration or branch
    LoopIteration,
}

#[derive(Debug, Clone)]
struct ScopeFrame {
    kind: ScopeKind,
    bindings: HashMap<String, Value>,
}

impl ScopeFrame {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            bindings: HashMap::new(),
        }
    }
}

/// Scope chain of name bindings owned by one run
#[derive(Debug, Clone)]
pub struct SharedState {
    frames: Vec<ScopeFrame>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Create a state with an empty flow scope
    pub fn new() -> Self {
        let mut flow = ScopeFrame::new(ScopeKind::Flow);
        flow.bindings
            .insert(STATE_BINDING.to_string(), Value::Object(Map::new()));
        flow.bindings
            .insert(STEP_BINDING.to_string(), Value::Object(Map::new()));
        Self { frames: vec![flow] }
    }

    /// Create a state whose flow scope holds the given inputs
    pub fn with_bindings(initial: Map<String, Value>) -> Self {
        let mut state = Self::new();
        for (name, value) in initial {
            state.frames[0].bindings.insert(name, value);
        }
        state
    }

    /// Number of open frames, including the flow scope
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Kind of the innermost frame
    pub fn current_kind(&self) -> ScopeKind {
        self.frames
            .last()
            .map(|frame| frame.kind)
            .unwrap_or(ScopeKind::Flow)
    }

    /// Bind `name` in the innermost frame of the given kind
    pub fn declare(
        &mut self,
        scope: ScopeKind,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), CoreError> {
        let frame = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| frame.kind == scope)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("No open {:?} scope to declare in", scope))
            })?;
        frame.bindings.insert(name.into(), value);
        Ok(())
    }

    /// Bind `name` in the innermost frame
    pub fn declare_local(&mut self, name: impl Into<String>, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.bindings.insert(name.into(), value);
        }
    }

    /// Update the innermost frame owning `name`, or bind it in the current frame
    pub fn assign(&mut self, name: &str, value: Value) {
        match self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| frame.bindings.contains_key(name))
        {
            Some(frame) => {
                frame.bindings.insert(name.to_string(), value);
            }
            None => self.declare_local(name.to_string(), value),
        }
    }

    /// Resolve a bare name through the scope chain
    pub fn resolve(&self, name: &str) -> Result<&Value, CoreError> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.bindings.get(name))
            .ok_or_else(|| CoreError::UnknownIdentifier(name.to_string()))
    }

    /// Whether `name` is bound in any visible frame
    pub fn is_bound(&self, name: &str) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.bindings.contains_key(name))
    }

    /// Resolve a dotted path such as `user.address.city` or `items.0`
    ///
    /// The first segment must be bound; missing nested fields yield `null`.
    pub fn resolve_path(&self, path: &str) -> Result<Value, CoreError> {
        let mut segments = path.split('.');
        let head = segments
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| CoreError::ValidationError(format!("Empty variable path: {:?}", path)))?;

        let mut current = self.resolve(head)?;
        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }

    /// Open a new innermost frame
    pub fn push_scope(&mut self, kind: ScopeKind) {
        self.frames.push(ScopeFrame::new(kind));
    }

    /// Close the innermost frame, discarding its bindings
    pub fn pop_scope(&mut self) -> Result<(), CoreError> {
        if self.frames.len() <= 1 {
            return Err(CoreError::ValidationError(
                "Cannot pop the flow scope".to_string(),
            ));
        }
        self.frames.pop();
        Ok(())
    }

    /// Open a frame that is closed when the returned guard drops
    pub fn scoped(&mut self, kind: ScopeKind) -> ScopeGuard<'_> {
        self.push_scope(kind);
        ScopeGuard { state: self }
    }

    /// Write a field of the flow-wide `state` object
    pub fn set_state_field(&mut self, field: &str, value: Value) {
        if let Some(Value::Object(map)) = self.frames[0].bindings.get_mut(STATE_BINDING) {
            map.insert(field.to_string(), value);
            return;
        }
        let mut map = Map::new();
        map.insert(field.to_string(), value);
        self.frames[0]
            .bindings
            .insert(STATE_BINDING.to_string(), Value::Object(map));
    }

    /// Record a completed step's output in flow scope
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        let steps = self.frames[0]
            .bindings
            .entry(STEP_BINDING.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !steps.is_object() {
            *steps = Value::Object(Map::new());
        }
        if let Value::Object(map) = steps {
            let mut entry = Map::new();
            entry.insert("output".to_string(), output);
            map.insert(step_id.to_string(), Value::Object(entry));
        }
    }

    /// Output recorded for a step, if it completed
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.frames[0]
            .bindings
            .get(STEP_BINDING)?
            .get(step_id)?
            .get("output")
    }

    /// Every visible binding, inner frames shadowing outer ones
    pub fn visible_bindings(&self) -> Value {
        let mut merged = Map::new();
        for frame in &self.frames {
            for (name, value) in &frame.bindings {
                merged.insert(name.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }

    /// Bindings of the flow scope
    pub fn flow_bindings(&self) -> Map<String, Value> {
        self.frames[0]
            .bindings
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Copy of this state with one extra frame, for a concurrent branch
    pub fn fork(&self, kind: ScopeKind) -> SharedState {
        let mut forked = self.clone();
        forked.push_scope(kind);
        forked
    }
}

/// Guard that pops its frame on every exit path
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    state: &'a mut SharedState,
}

impl Deref for ScopeGuard<'_> {
    type Target = SharedState;

    fn deref(&self) -> &SharedState {
        self.state
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut SharedState {
        self.state
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.state.frames.len() > 1 {
            self.state.frames.pop();
        }
    }
}
