//! Quota and diversity driven selection with tiered exclusion relaxation.
//!
//! Slots fill in priority order. Each slot first takes clean candidates that
//! respect the genre and year caps, then replays candidates deferred by short
//! term memory, then by rotation history, then by the failure registry. Caps
//! hold in every tier. Whatever capacity is left afterwards is filled from any
//! unselected candidate and tagged `random`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::hero::candidate::Candidate;
use crate::policy::{DiversityWeights, SlotPlan};
use crate::protocol::{SlotCounts, SlotName};

/// Why a candidate is held back, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExclusionTier {
    Memory,
    History,
    Failure,
}

impl ExclusionTier {
    pub const REPLAY_ORDER: [ExclusionTier; 3] = [
        ExclusionTier::Memory,
        ExclusionTier::History,
        ExclusionTier::Failure,
    ];

    fn index(self) -> usize {
        match self {
            Self::Memory => 0,
            Self::History => 1,
            Self::Failure => 2,
        }
    }
}

/// Id sets the planner avoids until it runs out of clean candidates.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub memory: HashSet<String>,
    pub history: HashSet<String>,
    pub failures: HashSet<String>,
}

impl Exclusions {
    /// The most severe tier that holds `id` back.
    pub fn tier(&self, id: &str) -> Option<ExclusionTier> {
        if self.failures.contains(id) {
            Some(ExclusionTier::Failure)
        } else if self.history.contains(id) {
            Some(ExclusionTier::History)
        } else if self.memory.contains(id) {
            Some(ExclusionTier::Memory)
        } else {
            None
        }
    }
}

/// Diversity cap for a weight: `ceil(P * (1 - w))` within `[min(2, P), P]`.
pub fn diversity_cap(pool_size: usize, weight: f64) -> usize {
    if pool_size == 0 {
        return 0;
    }
    let weight = if weight.is_finite() {
        weight.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let raw = (pool_size as f64 * (1.0 - weight)).ceil() as usize;
    raw.clamp(pool_size.min(2), pool_size).max(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedCandidate {
    pub candidate: Candidate,
    pub slot: SlotName,
    /// Tier the candidate was admitted from; `None` for clean picks.
    pub relaxed_from: Option<ExclusionTier>,
}

/// Accumulated state of one planning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionContext {
    pub pool_size: usize,
    pub selected: Vec<SelectedCandidate>,
    pub slot_counts: SlotCounts,
    pub genre_counts: HashMap<String, usize>,
    pub year_counts: HashMap<i32, usize>,
    pub selected_ids: HashSet<String>,
    pub genre_cap: usize,
    pub year_cap: usize,
}

impl SelectionContext {
    pub fn new(pool_size: usize, weights: &DiversityWeights) -> Self {
        Self {
            pool_size,
            selected: Vec::with_capacity(pool_size),
            slot_counts: SlotName::PRIORITY.iter().map(|slot| (*slot, 0)).collect(),
            genre_counts: HashMap::new(),
            year_counts: HashMap::new(),
            selected_ids: HashSet::with_capacity(pool_size),
            genre_cap: diversity_cap(pool_size, weights.genre),
            year_cap: diversity_cap(pool_size, weights.year),
        }
    }

    pub fn is_full(&self) -> bool {
        self.selected.len() >= self.pool_size
    }

    pub fn slot_count(&self, slot: SlotName) -> usize {
        self.slot_counts.get(&slot).copied().unwrap_or(0)
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected_ids.contains(id)
    }

    pub fn violates_caps(&self, candidate: &Candidate) -> bool {
        let genre_over = candidate.genres.iter().any(|genre| {
            self.genre_counts.get(genre).copied().unwrap_or(0) >= self.genre_cap
        });
        let year_over = candidate
            .year
            .is_some_and(|year| self.year_counts.get(&year).copied().unwrap_or(0) >= self.year_cap);
        genre_over || year_over
    }

    fn admit(&mut self, candidate: &Candidate, slot: SlotName, relaxed_from: Option<ExclusionTier>) {
        for genre in &candidate.genres {
            *self.genre_counts.entry(genre.clone()).or_insert(0) += 1;
        }
        if let Some(year) = candidate.year {
            *self.year_counts.entry(year).or_insert(0) += 1;
        }
        *self.slot_counts.entry(slot).or_insert(0) += 1;
        self.selected_ids.insert(candidate.id.clone());
        self.selected.push(SelectedCandidate {
            candidate: candidate.clone(),
            slot,
            relaxed_from,
        });
    }

    pub fn selected_ids_in_order(&self) -> Vec<String> {
        self.selected
            .iter()
            .map(|selected| selected.candidate.id.clone())
            .collect()
    }
}

/// Seeded generator for the random view; seeds from the OS when none is given.
pub fn selection_rng(seed: Option<u64>) -> StdRng {
    if let Some(seed) = seed {
        return StdRng::seed_from_u64(seed);
    }
    let mut bytes = [0u8; 32];
    match getrandom::fill(&mut bytes) {
        Ok(()) => StdRng::from_seed(bytes),
        Err(error) => {
            log::warn!("Hero: OS randomness unavailable ({}), seeding from clock", error);
            StdRng::seed_from_u64(crate::now_unix_ms() as u64)
        }
    }
}

fn descending_option<T: PartialOrd>(left: Option<T>, right: Option<T>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => right.partial_cmp(&left).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Most recently added first.
pub fn new_view(candidates: &[Candidate]) -> Vec<usize> {
    let mut view: Vec<usize> = (0..candidates.len()).collect();
    view.sort_by(|&left, &right| {
        descending_option(candidates[left].added_at_ms, candidates[right].added_at_ms)
    });
    view
}

/// Rating desc, votes desc, added desc. Unrated items last.
pub fn top_rated_view(candidates: &[Candidate]) -> Vec<usize> {
    let mut view: Vec<usize> = (0..candidates.len()).collect();
    view.sort_by(|&left, &right| {
        let (a, b) = (&candidates[left], &candidates[right]);
        descending_option(a.rating, b.rating)
            .then_with(|| b.vote_count.cmp(&a.vote_count))
            .then_with(|| descending_option(a.added_at_ms, b.added_at_ms))
    });
    view
}

/// Old items only: oldest year first, then rating desc, then added desc.
pub fn old_but_gold_view(candidates: &[Candidate]) -> Vec<usize> {
    let mut view: Vec<usize> = (0..candidates.len())
        .filter(|&index| candidates[index].is_old)
        .collect();
    view.sort_by(|&left, &right| {
        let (a, b) = (&candidates[left], &candidates[right]);
        a.year
            .cmp(&b.year)
            .then_with(|| descending_option(a.rating, b.rating))
            .then_with(|| descending_option(a.added_at_ms, b.added_at_ms))
    });
    view
}

pub fn random_view(candidates: &[Candidate], rng: &mut StdRng) -> Vec<usize> {
    let mut view: Vec<usize> = (0..candidates.len()).collect();
    view.shuffle(rng);
    view
}

fn slot_is_full(context: &SelectionContext, slot: SlotName, target: usize) -> bool {
    context.is_full() || context.slot_count(slot) >= target
}

/// Clean candidates only; nothing is deferred.
fn strict_pass(
    context: &mut SelectionContext,
    candidates: &[Candidate],
    view: &[usize],
    slot: SlotName,
    target: usize,
    exclusions: &Exclusions,
) {
    for &index in view {
        if slot_is_full(context, slot, target) {
            return;
        }
        let candidate = &candidates[index];
        if context.is_selected(&candidate.id)
            || exclusions.tier(&candidate.id).is_some()
            || context.violates_caps(candidate)
        {
            continue;
        }
        context.admit(candidate, slot, None);
    }
}

fn relaxed_pass(
    context: &mut SelectionContext,
    candidates: &[Candidate],
    view: &[usize],
    slot: SlotName,
    target: usize,
    exclusions: &Exclusions,
) {
    let mut deferred: [Vec<usize>; 3] = Default::default();
    for &index in view {
        if slot_is_full(context, slot, target) {
            return;
        }
        let candidate = &candidates[index];
        if context.is_selected(&candidate.id) {
            continue;
        }
        if let Some(tier) = exclusions.tier(&candidate.id) {
            deferred[tier.index()].push(index);
            continue;
        }
        if context.violates_caps(candidate) {
            continue;
        }
        context.admit(candidate, slot, None);
    }

    for tier in ExclusionTier::REPLAY_ORDER {
        for &index in &deferred[tier.index()] {
            if slot_is_full(context, slot, target) {
                return;
            }
            let candidate = &candidates[index];
            if context.is_selected(&candidate.id) || context.violates_caps(candidate) {
                continue;
            }
            context.admit(candidate, slot, Some(tier));
        }
    }
}

/// Fills leftover capacity ignoring caps: clean first, then each exclusion tier.
fn final_fill(
    context: &mut SelectionContext,
    candidates: &[Candidate],
    view: &[usize],
    exclusions: &Exclusions,
) {
    let tiers = [
        None,
        Some(ExclusionTier::Memory),
        Some(ExclusionTier::History),
        Some(ExclusionTier::Failure),
    ];
    for wanted in tiers {
        for &index in view {
            if context.is_full() {
                return;
            }
            let candidate = &candidates[index];
            if context.is_selected(&candidate.id) || exclusions.tier(&candidate.id) != wanted {
                continue;
            }
            context.admit(candidate, SlotName::Random, wanted);
        }
    }
}

/// Plans one pool. The result preserves selection order.
pub fn plan(
    candidates: &[Candidate],
    slot_plan: &SlotPlan,
    weights: &DiversityWeights,
    exclusions: &Exclusions,
    rng: &mut StdRng,
) -> SelectionContext {
    let pool_size = slot_plan.total();
    let mut context = SelectionContext::new(pool_size, weights);
    if pool_size == 0 || candidates.is_empty() {
        return context;
    }

    let random = random_view(candidates, rng);
    for slot in SlotName::PRIORITY {
        let target = slot_plan.get(slot);
        if target == 0 {
            continue;
        }
        match slot {
            SlotName::New => {
                let by_added = new_view(candidates);
                let fresh: Vec<usize> = by_added
                    .iter()
                    .copied()
                    .filter(|&index| candidates[index].is_new)
                    .collect();
                strict_pass(&mut context, candidates, &fresh, slot, target, exclusions);
                relaxed_pass(&mut context, candidates, &by_added, slot, target, exclusions);
            }
            SlotName::TopRated => {
                let view = top_rated_view(candidates);
                relaxed_pass(&mut context, candidates, &view, slot, target, exclusions);
            }
            SlotName::OldButGold => {
                let view = old_but_gold_view(candidates);
                relaxed_pass(&mut context, candidates, &view, slot, target, exclusions);
            }
            SlotName::Random => {
                relaxed_pass(&mut context, candidates, &random, slot, target, exclusions);
            }
        }
    }

    final_fill(&mut context, candidates, &random, exclusions);
    context
}
