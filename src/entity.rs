// Entities, prototypes, and the event-handler tables.
//
// The class hierarchy of a conventional agent framework collapses
// here to one record plus a kind tag: a simulation has no geometry,
// a patch owns one, agents and disturbances borrow their parent
// patch's. A prototype carries everything shared by all instances of
// one declared entity (handler groups, attribute slot bijection,
// dispatch cache, per-slot event bitsets) behind an Arc; an instance
// is its value slots plus the handle.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};

use crate::error::{EngineResult, JoshError};
use crate::grid::{GeoMoment, Geometry};
use crate::machine::Action;
use crate::value::EngineValue;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Simulation,
    Patch,
    Agent,
    Disturbance,
    External,
}

impl EntityKind {
    /// Map a stanza kind word; `organism` and `management` are both
    /// agents.
    pub fn from_word(word: &str) -> Option<EntityKind> {
        let kind = match word {
            "simulation" => EntityKind::Simulation,
            "patch" => EntityKind::Patch,
            "agent" | "organism" | "management" => EntityKind::Agent,
            "disturbance" => EntityKind::Disturbance,
            "external" => EntityKind::External,
            _ => return None,
        };
        Some(kind)
    }
}

// Lifecycle events. A bitset per attribute slot records which events
// have any handler, so the scheduler skips unhandled slots in O(1).
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    Init = 0b000001,
    Start = 0b000010,
    Step = 0b000100,
    End = 0b001000,
    Remove = 0b010000,
    Constant = 0b100000,
}

pub type EventSet = BitFlags<Event>;

impl Event {
    pub fn from_name(name: &str) -> Option<Event> {
        let event = match name {
            "init" => Event::Init,
            "start" => Event::Start,
            "step" => Event::Step,
            "end" => Event::End,
            "remove" => Event::Remove,
            "constant" => Event::Constant,
            _ => return None,
        };
        Some(event)
    }

    pub fn name(self) -> &'static str {
        match self {
            Event::Init => "init",
            Event::Start => "start",
            Event::Step => "step",
            Event::End => "end",
            Event::Remove => "remove",
            Event::Constant => "constant",
        }
    }
}

/// Dispatch key: `state == None` means "any state".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub state: Option<String>,
    pub attribute: String,
    pub event: Event,
}

impl EventKey {
    /// Decode a handler name: the trailing dotted token names the
    /// event when it is one of the reserved six; otherwise the event
    /// is `constant` and the whole dotted name is the attribute.
    pub fn decode(name: &str) -> (String, Event) {
        match name.rsplit_once('.') {
            Some((attribute, last)) => match Event::from_name(last) {
                Some(event) => (attribute.to_string(), event),
                None => (name.to_string(), Event::Constant),
            },
            None => (name.to_string(), Event::Constant),
        }
    }
}

/// One compiled handler: an optional boolean selector gating an
/// action-chain body.
#[derive(Clone, Debug)]
pub struct CompiledHandler {
    pub selector: Option<Arc<Vec<Action>>>,
    pub body: Arc<Vec<Action>>,
}

/// The ordered handlers sharing one EventKey. At most one fires per
/// dispatch: the first whose selector is absent or true.
#[derive(Clone, Debug)]
pub struct EventHandlerGroup {
    pub key: EventKey,
    pub handlers: Vec<CompiledHandler>,
}

type DispatchKey = (usize, Event, Option<String>);

#[derive(Debug)]
pub struct Prototype {
    pub name: String,
    pub kind: EntityKind,
    /// Attribute names in declaration order; index is the slot.
    pub attributes: Vec<String>,
    slots: HashMap<String, usize>,
    groups: HashMap<EventKey, EventHandlerGroup>,
    cache: HashMap<DispatchKey, Arc<Vec<CompiledHandler>>>,
    handled: Vec<EventSet>,
}

impl Prototype {
    /// Build the shared record from compiled groups. Derived indices
    /// (slot bijection, dispatch cache, event bitsets) are computed
    /// once here; runtime dispatch never rescans the group map.
    pub fn assemble(
        name: String,
        kind: EntityKind,
        compiled: Vec<EventHandlerGroup>,
    ) -> Prototype {
        let mut attributes: Vec<String> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();
        for group in &compiled {
            if !slots.contains_key(&group.key.attribute) {
                slots.insert(group.key.attribute.clone(), attributes.len());
                attributes.push(group.key.attribute.clone());
            }
        }

        let mut groups: HashMap<EventKey, EventHandlerGroup> = HashMap::new();
        for group in compiled {
            match groups.get_mut(&group.key) {
                Some(existing) => existing.handlers.extend(group.handlers),
                None => {
                    groups.insert(group.key.clone(), group);
                }
            }
        }

        let mut handled = vec![EventSet::empty(); attributes.len()];
        let mut cache: HashMap<DispatchKey, Arc<Vec<CompiledHandler>>> = HashMap::new();
        for (key, group) in &groups {
            let slot = slots[&key.attribute];
            handled[slot] |= key.event;
            cache.insert(
                (slot, key.event, key.state.clone()),
                Arc::new(group.handlers.clone()),
            );
        }

        Prototype {
            name,
            kind,
            attributes,
            slots,
            groups,
            cache,
            handled,
        }
    }

    pub fn slot(&self, attribute: &str) -> Option<usize> {
        self.slots.get(attribute).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.attributes.len()
    }

    /// Whether any handler (in any state) exists for this slot and
    /// event.
    pub fn has_event(&self, slot: usize, event: Event) -> bool {
        self.handled[slot].contains(event)
    }

    /// The precomputed handler list for a dispatch. State-specific
    /// entries win over the stateless entry.
    pub fn handlers(
        &self,
        slot: usize,
        event: Event,
        state: Option<&str>,
    ) -> Option<Arc<Vec<CompiledHandler>>> {
        if let Some(state) = state {
            let keyed = (slot, event, Some(state.to_string()));
            if let Some(found) = self.cache.get(&keyed) {
                return Some(found.clone());
            }
        }
        self.cache.get(&(slot, event, None)).cloned()
    }

    pub fn groups(&self) -> &HashMap<EventKey, EventHandlerGroup> {
        &self.groups
    }

    /// A fresh instance. Patch prototypes take a geometry; member
    /// prototypes take their parent patch's moment as a non-owning
    /// back-reference; the simulation takes neither.
    pub fn instantiate(
        self: &Arc<Self>,
        geometry: Option<Geometry>,
        parent: Option<GeoMoment>,
        born_step: i64,
    ) -> Entity {
        let n = self.attributes.len();
        Entity {
            proto: self.clone(),
            prior: vec![None; n],
            current: vec![None; n],
            constants: vec![None; n],
            in_progress: vec![false; n],
            geometry,
            parent,
            born_step,
            locked: false,
        }
    }
}

/// A live, mutable entity instance.
#[derive(Debug)]
pub struct Entity {
    pub proto: Arc<Prototype>,
    prior: Vec<Option<EngineValue>>,
    current: Vec<Option<EngineValue>>,
    constants: Vec<Option<EngineValue>>,
    in_progress: Vec<bool>,
    pub geometry: Option<Geometry>,
    pub parent: Option<GeoMoment>,
    pub born_step: i64,
    locked: bool,
}

impl Entity {
    pub fn name(&self) -> &str {
        &self.proto.name
    }

    pub fn prior_value(&self, slot: usize) -> Option<&EngineValue> {
        self.prior[slot].as_ref()
    }

    pub fn current_value(&self, slot: usize) -> Option<&EngineValue> {
        self.current[slot].as_ref()
    }

    pub fn set_current(&mut self, slot: usize, value: EngineValue) {
        self.current[slot] = Some(value);
    }

    pub fn constant_value(&self, slot: usize) -> Option<&EngineValue> {
        self.constants[slot].as_ref()
    }

    pub fn set_constant(&mut self, slot: usize, value: EngineValue) {
        self.constants[slot] = Some(value);
    }

    pub fn in_progress(&self, slot: usize) -> bool {
        self.in_progress[slot]
    }

    pub fn mark_in_progress(&mut self, slot: usize, flag: bool) {
        self.in_progress[slot] = flag;
    }

    /// The entity's state attribute as a string, if any.
    pub fn state(&self) -> Option<String> {
        let slot = self.proto.slot("state")?;
        let value = self.current[slot].as_ref().or(self.prior[slot].as_ref())?;
        match value {
            EngineValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Step boundary: current moves into prior (not copied) and a
    /// fresh empty current table takes its place.
    pub fn promote(&mut self) {
        let n = self.current.len();
        self.prior = mem::replace(&mut self.current, vec![None; n]);
        self.in_progress = vec![false; n];
    }

    /// Immutable snapshot of the requested timeline.
    pub fn freeze(&self, timeline: Timeline) -> Arc<FrozenEntity> {
        let table = match timeline {
            Timeline::Prior => &self.prior,
            Timeline::Current => &self.current,
        };
        let mut attrs = BTreeMap::new();
        for (slot, value) in table.iter().enumerate() {
            if let Some(value) = value {
                attrs.insert(self.proto.attributes[slot].clone(), value.clone());
            }
        }
        Arc::new(FrozenEntity {
            name: self.proto.name.clone(),
            attrs,
            geometry: self.geometry.clone(),
        })
    }

    /// The snapshot collection references see: prior for settled
    /// entities, current for instances born this step (their init
    /// pass already ran).
    pub fn collection_snapshot(&self, step: i64) -> Arc<FrozenEntity> {
        if self.born_step == step {
            self.freeze(Timeline::Current)
        } else {
            self.freeze(Timeline::Prior)
        }
    }

    // Advisory locks: user-level patterns only, nothing in the
    // scheduler takes them.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeline {
    Prior,
    Current,
}

pub type Snapshot = Arc<FrozenEntity>;

/// The frozen form handed across entity boundaries: attributes, name
/// and geometry, no handlers. There is no mutating surface; the
/// fallible setter exists so callers holding one get the frozen
/// mutation error instead of silence.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenEntity {
    pub name: String,
    pub attrs: BTreeMap<String, EngineValue>,
    pub geometry: Option<Geometry>,
}

impl FrozenEntity {
    pub fn get(&self, attribute: &str) -> Option<&EngineValue> {
        self.attrs.get(attribute)
    }

    pub fn try_set(&self, attribute: &str, _value: EngineValue) -> EngineResult<()> {
        Err(JoshError::FrozenMutation {
            entity: self.name.clone(),
            attribute: attribute.to_string(),
        })
    }
}
