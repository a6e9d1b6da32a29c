// The per-step scheduler.
//
// A simulation instance is the simulation entity plus a row-major
// grid of patch shards, each owning its member entities. Each step:
//
//   1. the simulation entity runs start, body, and end; its current
//      table freezes as `meta` for the rest of the step;
//   2. a spatial index is built from prior-timeline snapshots;
//   3. patches run start, body, end — serially or in parallel, with
//      a barrier between phases either way, so both modes produce
//      identical output;
//   4. rows are exported, remove handlers run, and every entity's
//      current table is promoted to prior.
//
// The body phase is a sweep that lazily ensures every attribute
// slot: a demanded slot evaluates at most once per step, an
// in-progress mark turns dependency cycles into errors instead of
// recursion, and slots with no handler for the step's event carry
// their prior value forward (or their cached constant).
//
// Each patch owns a SmallRng behind a mutex, reseeded every step
// from (base seed, step, patch index), so runs reproduce regardless
// of thread scheduling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::compiler::CompiledProgram;
use crate::convert::Converter;
use crate::distribution::RealizedDistribution;
use crate::entity::{
    CompiledHandler, Entity, EntityKind, Event, Prototype, Snapshot, Timeline,
};
use crate::error::{EngineResult, JoshError};
use crate::export::Exporter;
use crate::external::{
    ConfigSource, EmptyConfig, ExternalResource, LayeredConfig, MapConfig, NullResource,
};
use crate::grid::{build_grid, Geometry, PatchKey, SpatialIndex};
use crate::machine::Machine;
use crate::scope::{parse_ref, HostScope, LocalScope, RefPath};
use crate::units::Units;
use crate::value::EngineValue;

/// The host-provided collaborators a run depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub external: Arc<dyn ExternalResource>,
    pub config: Arc<dyn ConfigSource>,
}

impl Default for Collaborators {
    fn default() -> Collaborators {
        Collaborators {
            external: Arc::new(NullResource),
            config: Arc::new(EmptyConfig),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Threading {
    Single,
    Parallel,
}

#[derive(Clone)]
pub struct RunOptions {
    pub seed: u64,
    pub replicate: u32,
    pub threading: Threading,
    pub cancel: Arc<AtomicBool>,
}

impl Default for RunOptions {
    fn default() -> RunOptions {
        RunOptions {
            seed: 0,
            replicate: 0,
            threading: Threading::Single,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

// Deterministic per-(seed, step, patch) stream seed, splitmix64
// finalized so neighboring patches do not correlate.
fn stream_seed(base: u64, step: i64, patch: u64) -> u64 {
    let mut z = base
        .wrapping_add((step as u64).wrapping_mul(0x9E3779B97F4A7C15))
        .wrapping_add(patch.wrapping_mul(0xBF58476D1CE4E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn lock_rng(rng: &Mutex<SmallRng>) -> std::sync::MutexGuard<'_, SmallRng> {
    rng.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One grid cell and the members it owns.
pub struct PatchShard {
    entity: Entity,
    members: Vec<Entity>,
    key: PatchKey,
    rng: Mutex<SmallRng>,
}

impl PatchShard {
    pub fn key(&self) -> &PatchKey {
        &self.key
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

// Everything a frame reads but never writes during a step.
struct StepShared<'a> {
    converter: &'a Arc<Converter>,
    prototypes: &'a HashMap<String, Arc<Prototype>>,
    external: &'a dyn ExternalResource,
    config: &'a dyn ConfigSource,
    meta: Option<&'a Snapshot>,
    spatial: Option<&'a SpatialIndex>,
    step: i64,
    body_event: Event,
}

/// Which entity a frame is evaluating: the frame's own principal
/// (the patch, or the simulation) or one of the patch's members.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Actor {
    Own,
    Member(usize),
}

// The shared lazy-evaluation core. Both frames (patch and
// simulation) expose their entities through this and get demand,
// ensure, and dispatch for free.
trait EvalFrame: HostScope + Sized {
    fn entity(&self, actor: Actor) -> &Entity;
    fn entity_mut(&mut self, actor: Actor) -> &mut Entity;
    fn body_event(&self) -> Event;
    fn step(&self) -> i64;
    fn swap_actor(&mut self, actor: Actor) -> Actor;
}

// The event a demanded attribute evaluates under: entities born this
// step are still in their init round even when the step at large has
// moved on.
fn demand_event<F: EvalFrame>(frame: &F, actor: Actor) -> Event {
    if frame.entity(actor).born_step == frame.step() {
        Event::Init
    } else {
        frame.body_event()
    }
}

/// Demand an attribute's current-timeline value, evaluating it if
/// this step has not yet.
fn demand_attr<F: EvalFrame>(
    frame: &mut F,
    actor: Actor,
    attr: &str,
) -> EngineResult<EngineValue> {
    let slot = frame
        .entity(actor)
        .proto
        .slot(attr)
        .ok_or_else(|| JoshError::UnknownAttribute(attr.to_string()))?;
    let event = demand_event(frame, actor);
    ensure_slot(frame, actor, slot, event)?
        .ok_or_else(|| JoshError::UnknownAttribute(attr.to_string()))
}

/// Ensure one slot for the given event: cached value, else handler,
/// else prior carry-forward, else cached constant, else absent.
fn ensure_slot<F: EvalFrame>(
    frame: &mut F,
    actor: Actor,
    slot: usize,
    event: Event,
) -> EngineResult<Option<EngineValue>> {
    if let Some(value) = frame.entity(actor).current_value(slot) {
        return Ok(Some(value.clone()));
    }
    if frame.entity(actor).in_progress(slot) {
        let entity = frame.entity(actor);
        return Err(JoshError::CyclicDependency {
            entity: entity.name().to_string(),
            attribute: entity.proto.attributes[slot].clone(),
        });
    }

    frame.entity_mut(actor).mark_in_progress(slot, true);
    let saved = frame.swap_actor(actor);
    let result = evaluate_slot(frame, actor, slot, event);
    frame.swap_actor(saved);
    frame.entity_mut(actor).mark_in_progress(slot, false);

    let value = result?;
    if let Some(value) = &value {
        frame.entity_mut(actor).set_current(slot, value.clone());
    }
    Ok(value)
}

fn evaluate_slot<F: EvalFrame>(
    frame: &mut F,
    actor: Actor,
    slot: usize,
    event: Event,
) -> EngineResult<Option<EngineValue>> {
    let proto = frame.entity(actor).proto.clone();

    if proto.has_event(slot, event) {
        let state = frame.entity(actor).state();
        if let Some(handlers) = proto.handlers(slot, event, state.as_deref()) {
            if let Some(value) = select_and_fire(frame, &handlers)? {
                return Ok(Some(value));
            }
            // Every selector declined: fall through to carry.
        }
    }

    if let Some(prior) = frame.entity(actor).prior_value(slot) {
        return Ok(Some(prior.clone()));
    }

    if event != Event::Constant && proto.has_event(slot, Event::Constant) {
        if let Some(cached) = frame.entity(actor).constant_value(slot) {
            return Ok(Some(cached.clone()));
        }
        let state = frame.entity(actor).state();
        if let Some(handlers) = proto.handlers(slot, Event::Constant, state.as_deref()) {
            if let Some(value) = select_and_fire(frame, &handlers)? {
                frame.entity_mut(actor).set_constant(slot, value.clone());
                return Ok(Some(value));
            }
        }
    }

    Ok(None)
}

/// Evaluate selectors in order; the first handler whose selector is
/// absent or true runs, and its value is the dispatch result.
fn select_and_fire<F: EvalFrame>(
    frame: &mut F,
    handlers: &[CompiledHandler],
) -> EngineResult<Option<EngineValue>> {
    for handler in handlers.iter() {
        let selected = match &handler.selector {
            None => true,
            Some(cond) => Machine::new(frame).evaluate(cond)?.as_bool()?,
        };
        if selected {
            let value = Machine::new(frame).execute(&handler.body)?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Run one lifecycle phase (start, end, remove) for an entity: fire
/// the event's handlers per slot and store results. Returns the
/// per-slot values for the caller (the remove pass reads them).
fn fire_phase<F: EvalFrame>(
    frame: &mut F,
    actor: Actor,
    event: Event,
    store: bool,
) -> EngineResult<Vec<EngineValue>> {
    let proto = frame.entity(actor).proto.clone();
    let mut produced = Vec::new();
    for slot in 0..proto.slot_count() {
        if !proto.has_event(slot, event) {
            continue;
        }
        let state = frame.entity(actor).state();
        let handlers = match proto.handlers(slot, event, state.as_deref()) {
            Some(handlers) => handlers,
            None => continue,
        };
        let saved = frame.swap_actor(actor);
        let fired = select_and_fire(frame, &handlers);
        frame.swap_actor(saved);
        if let Some(value) = fired? {
            if store {
                frame.entity_mut(actor).set_current(slot, value.clone());
            }
            produced.push(value);
        }
    }
    Ok(produced)
}

/// The body sweep: ensure every slot of the entity for the step's
/// body event.
fn sweep_entity<F: EvalFrame>(frame: &mut F, actor: Actor) -> EngineResult<()> {
    let slots = frame.entity(actor).proto.slot_count();
    let event = demand_event(frame, actor);
    for slot in 0..slots {
        ensure_slot(frame, actor, slot, event)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The patch frame.

struct PatchFrame<'a> {
    shard: &'a mut PatchShard,
    ctx: &'a StepShared<'a>,
    actor: Actor,
}

impl<'a> PatchFrame<'a> {
    fn geometry(&self) -> EngineResult<&Geometry> {
        self.shard
            .entity
            .geometry
            .as_ref()
            .ok_or_else(|| JoshError::UnknownAttribute("patch geometry".to_string()))
    }

    /// Distribution of a member collection's snapshots, or of one
    /// attribute across them.
    fn collection(&self, type_name: &str, attr: Option<&str>) -> EngineResult<EngineValue> {
        let mut values = Vec::new();
        for member in &self.shard.members {
            if member.name() != type_name {
                continue;
            }
            let snapshot = member.collection_snapshot(self.ctx.step);
            match attr {
                None => values.push(EngineValue::Entity(snapshot)),
                Some(attr) => {
                    let value = snapshot.get(attr).cloned().ok_or_else(|| {
                        JoshError::UnknownAttribute(format!("{}.{}", type_name, attr))
                    })?;
                    values.push(value);
                }
            }
        }
        Ok(RealizedDistribution::from_values(values)?.into_value())
    }

    fn distance_in_meters(&self, distance: &EngineValue) -> EngineResult<f64> {
        use bigdecimal::ToPrimitive;
        let meters = Units::atom("m");
        let converted = if distance.units() == meters {
            distance.clone()
        } else {
            self.ctx.converter.convert(distance.clone(), &meters)?
        };
        converted
            .to_decimal()?
            .to_f64()
            .ok_or_else(|| crate::error::arithmetic("distance out of range"))
    }
}

impl<'a> EvalFrame for PatchFrame<'a> {
    fn entity(&self, actor: Actor) -> &Entity {
        match actor {
            Actor::Own => &self.shard.entity,
            Actor::Member(i) => &self.shard.members[i],
        }
    }

    fn entity_mut(&mut self, actor: Actor) -> &mut Entity {
        match actor {
            Actor::Own => &mut self.shard.entity,
            Actor::Member(i) => &mut self.shard.members[i],
        }
    }

    fn body_event(&self) -> Event {
        self.ctx.body_event
    }

    fn step(&self) -> i64 {
        self.ctx.step
    }

    fn swap_actor(&mut self, actor: Actor) -> Actor {
        std::mem::replace(&mut self.actor, actor)
    }
}

impl<'a> HostScope for PatchFrame<'a> {
    fn resolve(&mut self, name: &str) -> EngineResult<EngineValue> {
        match parse_ref(name) {
            RefPath::Prior(attr) => {
                let entity = self.entity(self.actor);
                let slot = entity
                    .proto
                    .slot(&attr)
                    .ok_or_else(|| JoshError::UnknownAttribute(name.to_string()))?;
                entity
                    .prior_value(slot)
                    .cloned()
                    .ok_or_else(|| JoshError::UnknownAttribute(name.to_string()))
            }
            RefPath::Current(attr) => demand_attr(self, self.actor, &attr),
            RefPath::Here(None) => {
                Ok(EngineValue::Entity(self.shard.entity.freeze(Timeline::Current)))
            }
            RefPath::Here(Some(rest)) => {
                // here.<Collection>.<attr> when the head names a
                // prototype, otherwise a patch attribute.
                match rest.split_once('.') {
                    Some((head, tail)) if self.ctx.prototypes.contains_key(head) => {
                        self.collection(head, Some(tail))
                    }
                    None if self.ctx.prototypes.contains_key(rest.as_str()) => {
                        self.collection(&rest, None)
                    }
                    _ => demand_attr(self, Actor::Own, &rest),
                }
            }
            RefPath::Meta(attr) => {
                let meta = self
                    .ctx
                    .meta
                    .ok_or_else(|| JoshError::UnknownAttribute(name.to_string()))?;
                meta.get(&attr)
                    .cloned()
                    .ok_or_else(|| JoshError::UnknownAttribute(name.to_string()))
            }
            RefPath::Plain(path) => {
                if self.entity(self.actor).proto.slot(&path).is_some() {
                    return demand_attr(self, self.actor, &path);
                }
                match path.split_once('.') {
                    Some((head, tail)) if self.ctx.prototypes.contains_key(head) => {
                        self.collection(head, Some(tail))
                    }
                    None if self.ctx.prototypes.contains_key(path.as_str()) => {
                        self.collection(&path, None)
                    }
                    _ => Err(JoshError::UnknownAttribute(name.to_string())),
                }
            }
        }
    }

    fn create(&mut self, prototype: &str, count: i64) -> EngineResult<EngineValue> {
        let proto = self
            .ctx
            .prototypes
            .get(prototype)
            .ok_or_else(|| JoshError::UnknownAttribute(format!("create {}", prototype)))?
            .clone();
        if !matches!(proto.kind, EntityKind::Agent | EntityKind::Disturbance) {
            return Err(JoshError::UnknownAttribute(format!(
                "create {}: not an agent or disturbance",
                prototype
            )));
        }
        debug!(
            "creating {} x {} in patch {:?}",
            count, prototype, self.shard.key.moment
        );
        let parent = self.geometry()?.moment();
        for _ in 0..count {
            let member = proto.instantiate(None, Some(parent), self.ctx.step);
            self.shard.members.push(member);
            let index = self.shard.members.len() - 1;
            // The newborn's init handlers run immediately, in
            // attribute-declaration order.
            for slot in 0..proto.slot_count() {
                ensure_slot(self, Actor::Member(index), slot, Event::Init)?;
            }
        }
        Ok(EngineValue::Int(count, Units::atom("count")))
    }

    fn spatial_query(
        &mut self,
        target: &str,
        distance: EngineValue,
    ) -> EngineResult<EngineValue> {
        let meters = self.distance_in_meters(&distance)?;
        let origin = self.geometry()?.clone();
        let spatial = self
            .ctx
            .spatial
            .ok_or_else(|| JoshError::UnknownAttribute("spatial index".to_string()))?;

        if target == "here" {
            let mut values = vec![EngineValue::Entity(
                self.shard.entity.freeze(Timeline::Prior),
            )];
            for snapshot in
                spatial.patch_snapshots_within(&origin, meters, origin.moment())
            {
                values.push(EngineValue::Entity(snapshot));
            }
            return Ok(RealizedDistribution::from_values(values)?.into_value());
        }

        // Members of the named type: the live patch first (same-step
        // creations included), then frozen snapshots from patches in
        // range.
        let mut values = Vec::new();
        for member in &self.shard.members {
            if member.name() == target {
                values.push(EngineValue::Entity(
                    member.collection_snapshot(self.ctx.step),
                ));
            }
        }
        for snapshot in spatial.members_within(&origin, meters, target, origin.moment()) {
            values.push(EngineValue::Entity(snapshot));
        }
        Ok(RealizedDistribution::from_values(values)?.into_value())
    }

    fn external_data(
        &mut self,
        name: &str,
        time: Option<EngineValue>,
    ) -> EngineResult<EngineValue> {
        let time = match time {
            Some(value) => Some(value.as_integer()?),
            None => None,
        };
        let geometry = self.geometry()?.clone();
        let distribution = self.ctx.external.distribution_for(name, &geometry, time)?;
        Ok(EngineValue::Distribution(distribution))
    }

    fn config_value(&mut self, name: &str) -> EngineResult<Option<EngineValue>> {
        Ok(self.ctx.config.get(name))
    }

    fn converter(&self) -> &Converter {
        self.ctx.converter
    }

    fn random_f64(&mut self) -> f64 {
        lock_rng(&self.shard.rng).gen::<f64>()
    }
}

// ---------------------------------------------------------------------------
// The simulation frame: same machinery, no patch underneath.

struct SimFrame<'a> {
    sim: &'a mut Entity,
    ctx: &'a StepShared<'a>,
    rng: &'a Mutex<SmallRng>,
}

impl<'a> EvalFrame for SimFrame<'a> {
    fn entity(&self, _actor: Actor) -> &Entity {
        self.sim
    }

    fn entity_mut(&mut self, _actor: Actor) -> &mut Entity {
        self.sim
    }

    fn body_event(&self) -> Event {
        self.ctx.body_event
    }

    fn step(&self) -> i64 {
        self.ctx.step
    }

    fn swap_actor(&mut self, _actor: Actor) -> Actor {
        Actor::Own
    }
}

impl<'a> HostScope for SimFrame<'a> {
    fn resolve(&mut self, name: &str) -> EngineResult<EngineValue> {
        match parse_ref(name) {
            RefPath::Prior(attr) => {
                let slot = self
                    .sim
                    .proto
                    .slot(&attr)
                    .ok_or_else(|| JoshError::UnknownAttribute(name.to_string()))?;
                self.sim
                    .prior_value(slot)
                    .cloned()
                    .ok_or_else(|| JoshError::UnknownAttribute(name.to_string()))
            }
            // For the simulation, current, meta, here and bare names
            // all land on its own attribute table.
            RefPath::Current(attr) | RefPath::Meta(attr) => {
                demand_attr(self, Actor::Own, &attr)
            }
            RefPath::Here(Some(attr)) => demand_attr(self, Actor::Own, &attr),
            RefPath::Here(None) => {
                Ok(EngineValue::Entity(self.sim.freeze(Timeline::Current)))
            }
            RefPath::Plain(path) => demand_attr(self, Actor::Own, &path),
        }
    }

    fn create(&mut self, prototype: &str, _count: i64) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(format!(
            "create {} outside a patch",
            prototype
        )))
    }

    fn spatial_query(
        &mut self,
        target: &str,
        _distance: EngineValue,
    ) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(format!(
            "{} within ... outside a patch",
            target
        )))
    }

    fn external_data(
        &mut self,
        name: &str,
        _time: Option<EngineValue>,
    ) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(format!(
            "external[{}] outside a patch",
            name
        )))
    }

    fn config_value(&mut self, name: &str) -> EngineResult<Option<EngineValue>> {
        Ok(self.ctx.config.get(name))
    }

    fn converter(&self) -> &Converter {
        self.ctx.converter
    }

    fn random_f64(&mut self) -> f64 {
        lock_rng(self.rng).gen::<f64>()
    }
}

// ---------------------------------------------------------------------------
// The simulation instance.

pub struct Simulation {
    name: String,
    sim: Entity,
    patches: Vec<PatchShard>,
    prototypes: HashMap<String, Arc<Prototype>>,
    converter: Arc<Converter>,
    external: Arc<dyn ExternalResource>,
    config: Arc<dyn ConfigSource>,
    sim_rng: Mutex<SmallRng>,
    steps_low: i64,
    steps_high: i64,
    step: i64,
    opts: RunOptions,
}

impl Simulation {
    pub fn new(
        program: &CompiledProgram,
        name: &str,
        collaborators: Collaborators,
        opts: RunOptions,
    ) -> EngineResult<Simulation> {
        let sim_proto = program
            .prototypes
            .get(name)
            .filter(|p| p.kind == EntityKind::Simulation)
            .ok_or_else(|| {
                JoshError::UnknownAttribute(format!("simulation '{}'", name))
            })?
            .clone();

        // Script-level config defaults sit under the host config.
        let config: Arc<dyn ConfigSource> = if program.config_defaults.is_empty() {
            collaborators.config.clone()
        } else {
            let mut defaults = MapConfig::new();
            for (key, chain) in &program.config_defaults {
                let mut scope = LocalScope::new(program.converter.clone());
                let value = Machine::new(&mut scope).evaluate(chain)?;
                defaults.insert(key, value);
            }
            Arc::new(LayeredConfig::new(vec![
                collaborators.config.clone(),
                Arc::new(defaults),
            ]))
        };

        let mut simulation = Simulation {
            name: name.to_string(),
            sim: sim_proto.instantiate(None, None, 0),
            patches: Vec::new(),
            prototypes: program.prototypes.clone(),
            converter: program.converter.clone(),
            external: collaborators.external,
            config,
            sim_rng: Mutex::new(SmallRng::seed_from_u64(opts.seed)),
            steps_low: 0,
            steps_high: 0,
            step: 0,
            opts,
        };
        simulation.read_meta_constants()?;
        simulation.build_patches()?;
        simulation.step = simulation.steps_low;
        info!(
            "simulation '{}' ready: steps [{}, {}], {} patches",
            simulation.name,
            simulation.steps_low,
            simulation.steps_high,
            simulation.patches.len()
        );
        Ok(simulation)
    }

    // Evaluate the simulation's constant meta-attributes needed
    // before the grid exists.
    fn meta_constant(&mut self, attr: &str) -> EngineResult<Option<EngineValue>> {
        let slot = match self.sim.proto.slot(attr) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let ctx = StepShared {
            converter: &self.converter,
            prototypes: &self.prototypes,
            external: self.external.as_ref(),
            config: self.config.as_ref(),
            meta: None,
            spatial: None,
            step: 0,
            body_event: Event::Constant,
        };
        let mut frame = SimFrame {
            sim: &mut self.sim,
            ctx: &ctx,
            rng: &self.sim_rng,
        };
        let value = ensure_slot(&mut frame, Actor::Own, slot, Event::Constant)?;
        Ok(value)
    }

    fn read_meta_constants(&mut self) -> EngineResult<()> {
        self.steps_low = match self.meta_constant("steps.low")? {
            Some(value) => value.as_integer()?,
            None => 0,
        };
        self.steps_high = match self.meta_constant("steps.high")? {
            Some(value) => value.as_integer()?,
            None => self.steps_low,
        };
        Ok(())
    }

    fn build_patches(&mut self) -> EngineResult<()> {
        use bigdecimal::ToPrimitive;

        let edge = match self.meta_constant("grid.size")? {
            Some(value) => {
                let meters = Units::atom("m");
                let value = if value.units().is_empty() || value.units() == meters {
                    value
                } else {
                    self.converter.convert(value, &meters)?
                };
                value
                    .to_decimal()?
                    .to_f64()
                    .ok_or_else(|| crate::error::arithmetic("grid.size out of range"))?
            }
            None => 1.0,
        };
        let width = match self.meta_constant("grid.width")? {
            Some(value) => value.as_integer()? as u32,
            None => 1,
        };
        let height = match self.meta_constant("grid.height")? {
            Some(value) => value.as_integer()? as u32,
            None => 1,
        };

        let patch_proto = {
            let mut candidates: Vec<&Arc<Prototype>> = self
                .prototypes
                .values()
                .filter(|p| p.kind == EntityKind::Patch)
                .collect();
            candidates.sort_by(|a, b| a.name.cmp(&b.name));
            candidates
                .iter()
                .find(|p| p.name == "Default")
                .or_else(|| candidates.first())
                .cloned()
                .cloned()
        };
        let patch_proto = match patch_proto {
            Some(proto) => proto,
            None => return Ok(()),
        };

        for geometry in build_grid(width, height, edge) {
            let key = PatchKey {
                simulation: self.name.clone(),
                moment: geometry.moment(),
                patch_type: patch_proto.name.clone(),
            };
            self.patches.push(PatchShard {
                entity: patch_proto.instantiate(Some(geometry), None, self.steps_low),
                members: Vec::new(),
                key,
                rng: Mutex::new(SmallRng::seed_from_u64(0)),
            });
        }
        Ok(())
    }

    fn check_cancel(&self) -> EngineResult<()> {
        if self.opts.cancel.load(Ordering::Relaxed) {
            Err(JoshError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn current_step(&self) -> i64 {
        self.step
    }

    pub fn steps(&self) -> (i64, i64) {
        (self.steps_low, self.steps_high)
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Run the whole closed step range, exporting after each step.
    pub fn run(&mut self, exporter: &mut dyn Exporter) -> EngineResult<()> {
        while self.step <= self.steps_high {
            self.step_once(exporter)?;
        }
        Ok(())
    }

    pub fn step_once(&mut self, exporter: &mut dyn Exporter) -> EngineResult<()> {
        let step = self.step;
        let body_event = if step == self.steps_low {
            Event::Init
        } else {
            Event::Step
        };
        debug!("step {} ({:?}) of '{}'", step, body_event, self.name);
        self.check_cancel()?;

        // Reseed the per-patch generators for this step.
        for (index, shard) in self.patches.iter_mut().enumerate() {
            shard.rng = Mutex::new(SmallRng::seed_from_u64(stream_seed(
                self.opts.seed,
                step,
                index as u64,
            )));
        }
        self.sim_rng = Mutex::new(SmallRng::seed_from_u64(stream_seed(
            self.opts.seed,
            step,
            u64::MAX,
        )));

        // Phase: the simulation entity completes first; its table
        // then freezes as meta for every patch.
        {
            let ctx = StepShared {
                converter: &self.converter,
                prototypes: &self.prototypes,
                external: self.external.as_ref(),
                config: self.config.as_ref(),
                meta: None,
                spatial: None,
                step,
                body_event,
            };
            let mut frame = SimFrame {
                sim: &mut self.sim,
                ctx: &ctx,
                rng: &self.sim_rng,
            };
            fire_phase(&mut frame, Actor::Own, Event::Start, true)?;
            sweep_entity(&mut frame, Actor::Own)?;
            fire_phase(&mut frame, Actor::Own, Event::End, true)?;
        }
        let meta = self.sim.freeze(Timeline::Current);
        self.check_cancel()?;

        // Frozen prior-timeline snapshots for cross-patch queries.
        let spatial = self.build_spatial_index();

        let ctx = StepShared {
            converter: &self.converter,
            prototypes: &self.prototypes,
            external: self.external.as_ref(),
            config: self.config.as_ref(),
            meta: Some(&meta),
            spatial: Some(&spatial),
            step,
            body_event,
        };

        // Patches in row-major order, members in insertion order,
        // with a barrier between phases in both threading modes.
        for phase in [Phase::Start, Phase::Body, Phase::End] {
            let cancel = &self.opts.cancel;
            match self.opts.threading {
                Threading::Single => {
                    for shard in self.patches.iter_mut() {
                        if cancel.load(Ordering::Relaxed) {
                            return Err(JoshError::Cancelled);
                        }
                        run_patch_phase(shard, &ctx, phase)?;
                    }
                }
                Threading::Parallel => {
                    self.patches.par_iter_mut().try_for_each(|shard| {
                        if cancel.load(Ordering::Relaxed) {
                            return Err(JoshError::Cancelled);
                        }
                        run_patch_phase(shard, &ctx, phase)
                    })?;
                }
            }
        }

        self.export(exporter)?;

        // Remove pass: after end, before promotion.
        for shard in self.patches.iter_mut() {
            remove_members(shard, &ctx)?;
        }

        drop(ctx);
        self.sim.promote();
        for shard in self.patches.iter_mut() {
            shard.entity.promote();
            for member in shard.members.iter_mut() {
                member.promote();
            }
        }
        self.step += 1;
        Ok(())
    }

    fn build_spatial_index(&self) -> SpatialIndex {
        let mut index = SpatialIndex::new();
        for shard in &self.patches {
            let geometry = match &shard.entity.geometry {
                Some(geometry) => geometry.clone(),
                None => continue,
            };
            let mut members: BTreeMap<String, Vec<Snapshot>> = BTreeMap::new();
            for member in &shard.members {
                members
                    .entry(member.name().to_string())
                    .or_default()
                    .push(member.freeze(Timeline::Prior));
            }
            index.push_patch(geometry, shard.entity.freeze(Timeline::Prior), members);
        }
        index
    }

    fn export(&self, exporter: &mut dyn Exporter) -> EngineResult<()> {
        let replicate = self.opts.replicate;
        exporter.write(
            self.step,
            replicate,
            self.sim.name(),
            &entity_attrs(&self.sim),
        )?;
        for shard in &self.patches {
            exporter.write(
                self.step,
                replicate,
                shard.entity.name(),
                &entity_attrs(&shard.entity),
            )?;
            for member in &shard.members {
                exporter.write(
                    self.step,
                    replicate,
                    member.name(),
                    &entity_attrs(member),
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    Body,
    End,
}

fn run_patch_phase(
    shard: &mut PatchShard,
    ctx: &StepShared,
    phase: Phase,
) -> EngineResult<()> {
    let mut frame = PatchFrame {
        shard,
        ctx,
        actor: Actor::Own,
    };
    match phase {
        Phase::Start => {
            fire_phase(&mut frame, Actor::Own, Event::Start, true)?;
            let mut index = 0;
            while index < frame.shard.members.len() {
                fire_phase(&mut frame, Actor::Member(index), Event::Start, true)?;
                index += 1;
            }
        }
        Phase::Body => {
            sweep_entity(&mut frame, Actor::Own)?;
            let mut index = 0;
            while index < frame.shard.members.len() {
                // Members born during this step were fully
                // initialized at creation; the sweep skips them.
                if frame.shard.members[index].born_step != ctx.step {
                    sweep_entity(&mut frame, Actor::Member(index))?;
                }
                index += 1;
            }
        }
        Phase::End => {
            fire_phase(&mut frame, Actor::Own, Event::End, true)?;
            let mut index = 0;
            while index < frame.shard.members.len() {
                fire_phase(&mut frame, Actor::Member(index), Event::End, true)?;
                index += 1;
            }
        }
    }
    Ok(())
}

/// Evaluate remove handlers; a member goes away when any of its
/// remove handlers yields true.
fn remove_members(shard: &mut PatchShard, ctx: &StepShared) -> EngineResult<()> {
    let mut doomed = Vec::new();
    {
        let mut frame = PatchFrame {
            shard: &mut *shard,
            ctx,
            actor: Actor::Own,
        };
        let mut index = 0;
        while index < frame.shard.members.len() {
            let produced =
                fire_phase(&mut frame, Actor::Member(index), Event::Remove, false)?;
            let mut remove = false;
            for value in produced {
                if value.as_bool()? {
                    remove = true;
                }
            }
            if remove {
                doomed.push(index);
            }
            index += 1;
        }
    }
    for index in doomed.into_iter().rev() {
        shard.members.remove(index);
    }
    Ok(())
}

fn entity_attrs(entity: &Entity) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    for (slot, name) in entity.proto.attributes.iter().enumerate() {
        if let Some(value) = entity.current_value(slot) {
            attrs.insert(name.clone(), value.to_string());
        }
    }
    attrs
}

/// Run a batch of independent replicates, each with a seed derived
/// from the base seed and its index.
pub fn run_replicates(
    program: &CompiledProgram,
    name: &str,
    collaborators: Collaborators,
    base: RunOptions,
    replicates: u32,
    exporter: &mut dyn Exporter,
) -> EngineResult<()> {
    for replicate in 0..replicates.max(1) {
        let opts = RunOptions {
            seed: base
                .seed
                .wrapping_add((replicate as u64).wrapping_mul(0xD6E8FEB86659FD93)),
            replicate,
            threading: base.threading,
            cancel: base.cancel.clone(),
        };
        let mut simulation =
            Simulation::new(program, name, collaborators.clone(), opts)?;
        simulation.run(exporter)?;
    }
    Ok(())
}
