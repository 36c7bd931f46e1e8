// 🧬 Entity Resolver - One company entity per real-world company
// Matching priority: exact identifier → name similarity → new entity.
// Identifier ownership is first-writer-wins: automatic resolution never
// reassigns an identifier to a different entity.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::schema::{CanonicalFundingEvent, Identifier, IdentifierKind};
use crate::sources::SourceId;

// ============================================================================
// COMPANY ENTITY
// ============================================================================

pub type EntityId = String;

/// Reference from an entity to one of its funding events
/// (the event itself lives in the store, keyed by this pair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub source: SourceId,
    pub source_record_id: String,
}

/// The unit of deduplication. Entities are created by the resolver and
/// never deleted by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyEntity {
    /// Stable identity (UUID) - never changes
    pub id: EntityId,

    /// Name from the first record that created this entity
    pub canonical_name: String,

    /// Normalized form the matcher compares against
    pub normalized_name: String,

    /// Known public identifiers; each value belongs to at most one entity
    pub identifiers: BTreeSet<Identifier>,

    pub country: Option<String>,

    /// Best available industry classification
    pub industry: Option<String>,

    /// Earliest event date seen for this entity
    pub first_seen: NaiveDate,

    /// Latest event date seen for this entity
    pub last_seen: NaiveDate,

    /// Associated funding events, in resolution order
    pub events: Vec<EventRef>,
}

impl CompanyEntity {
    fn from_event(event: &CanonicalFundingEvent) -> Self {
        CompanyEntity {
            id: uuid::Uuid::new_v4().to_string(),
            canonical_name: event.company_name.clone(),
            normalized_name: event.normalized_name.clone(),
            identifiers: BTreeSet::new(),
            country: event.country.clone(),
            industry: event.industry.clone(),
            first_seen: event.event_date,
            last_seen: event.event_date,
            events: Vec::new(),
        }
    }

    /// The entity's domain identifier, if one is known.
    pub fn domain(&self) -> Option<&str> {
        self.identifiers
            .iter()
            .find(|i| i.kind == IdentifierKind::Domain)
            .map(|i| i.value.as_str())
    }
}

// ============================================================================
// RESOLUTION OUTCOME
// ============================================================================

/// An identifier claimed by two entities. Policy: log, keep the first
/// owner, still attach the event - never drop it silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConflict {
    pub identifier: Identifier,
    pub owner: EntityId,
    pub claimant: EntityId,
    pub event: EventRef,
}

/// What `resolve` decided for one event.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub entity_id: EntityId,
    pub is_new_entity: bool,
    pub conflicts: Vec<ResolutionConflict>,
}

// ============================================================================
// NAME SIMILARITY
// ============================================================================

/// Pluggable similarity strategy over already-normalized names.
/// Must be deterministic and side-effect free so repeated runs over the
/// same input converge to the same merges.
pub trait NameSimilarity {
    /// Score in [0, 1]; 1.0 means the names are the same company name.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Default strategy: normalized Levenshtein ratio with an acronym boost
/// and a penalty for very short names.
pub struct LevenshteinSimilarity;

impl NameSimilarity for LevenshteinSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }

        let max_len = a.chars().count().max(b.chars().count());
        let distance = levenshtein(a, b);
        let mut score = 1.0 - (distance as f64 / max_len as f64);

        // "abc" vs "applied biological computing" style matches
        if is_acronym_match(a, b) {
            score += 0.3;
        }

        // Very short names match too easily by edit distance alone
        if a.chars().count() <= 3 || b.chars().count() <= 3 {
            score *= 0.7;
        }

        score.clamp(0.0, 1.0)
    }
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn acronym_of(name: &str) -> Option<String> {
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.len() < 2 {
        return None;
    }
    Some(words.iter().filter_map(|w| w.chars().next()).collect())
}

/// True when one name is the acronym of the other (3+ letters).
fn is_acronym_match(a: &str, b: &str) -> bool {
    let collapsed_a = a.replace(' ', "");
    let collapsed_b = b.replace(' ', "");
    let acr_a = acronym_of(a);
    let acr_b = acronym_of(b);

    if let (Some(x), Some(y)) = (&acr_a, &acr_b) {
        if x.len() >= 3 && x == y {
            return true;
        }
    }
    if let Some(x) = &acr_a {
        if x.len() >= 3 && *x == collapsed_b {
            return true;
        }
    }
    if let Some(y) = &acr_b {
        if y.len() >= 3 && *y == collapsed_a {
            return true;
        }
    }
    false
}

// ============================================================================
// ENTITY REGISTRY
// ============================================================================

/// Confidence required before a name-similarity match merges records.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Registry of all known company entities plus the identifier ownership
/// index. The single writer for CompanyEntity state.
pub struct EntityRegistry {
    /// Insertion order is the deterministic tie-break for heuristic matches
    entities: Vec<CompanyEntity>,
    by_id: HashMap<EntityId, usize>,
    /// identifier → owning entity index (first writer wins, never reassigned)
    owner: HashMap<Identifier, usize>,
    matcher: Box<dyn NameSimilarity + Send>,
    similarity_threshold: f64,
}

impl EntityRegistry {
    /// Empty registry with the default matcher and threshold.
    pub fn new() -> Self {
        Self::with_matcher(Box::new(LevenshteinSimilarity), DEFAULT_SIMILARITY_THRESHOLD)
    }

    pub fn with_matcher(matcher: Box<dyn NameSimilarity + Send>, threshold: f64) -> Self {
        EntityRegistry {
            entities: Vec::new(),
            by_id: HashMap::new(),
            owner: HashMap::new(),
            matcher,
            similarity_threshold: threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &CompanyEntity> {
        self.entities.iter()
    }

    pub fn get(&self, id: &str) -> Option<&CompanyEntity> {
        self.by_id.get(id).map(|&idx| &self.entities[idx])
    }

    /// Re-register a persisted entity (store load path). Identifier
    /// ownership follows insertion order, matching how it was first won.
    pub fn insert_existing(&mut self, entity: CompanyEntity) {
        let idx = self.entities.len();
        self.by_id.insert(entity.id.clone(), idx);
        for ident in &entity.identifiers {
            self.owner.entry(ident.clone()).or_insert(idx);
        }
        self.entities.push(entity);
    }

    /// Decide which entity an event belongs to, mutating the registry.
    ///
    /// Priority: exact identifier match, then name similarity among
    /// same-country candidates, then a brand-new entity.
    pub fn resolve(&mut self, event: &CanonicalFundingEvent) -> Resolution {
        // 1. Exact identifier match (strongest signal)
        for ident in &event.identifiers {
            if let Some(&idx) = self.owner.get(ident) {
                let conflicts = self.attach(idx, event);
                return Resolution {
                    entity_id: self.entities[idx].id.clone(),
                    is_new_entity: false,
                    conflicts,
                };
            }
        }

        // 2. Heuristic name match
        if let Some(idx) = self.best_heuristic_match(event) {
            let conflicts = self.attach(idx, event);
            return Resolution {
                entity_id: self.entities[idx].id.clone(),
                is_new_entity: false,
                conflicts,
            };
        }

        // 3. New entity; its identifiers are necessarily unowned (an owned
        // identifier would have matched in step 1)
        let entity = CompanyEntity::from_event(event);
        let entity_id = entity.id.clone();
        let idx = self.entities.len();
        self.by_id.insert(entity_id.clone(), idx);
        self.entities.push(entity);
        let conflicts = self.attach(idx, event);
        debug_assert!(conflicts.is_empty());

        Resolution {
            entity_id,
            is_new_entity: true,
            conflicts,
        }
    }

    /// Top-scoring candidate at or above the threshold, or None.
    /// Candidates must not disagree on country or domain.
    fn best_heuristic_match(&self, event: &CanonicalFundingEvent) -> Option<usize> {
        let event_domain = event
            .identifiers
            .iter()
            .find(|i| i.kind == IdentifierKind::Domain)
            .map(|i| i.value.as_str());

        let mut best: Option<(f64, usize)> = None;
        for (idx, entity) in self.entities.iter().enumerate() {
            if let (Some(a), Some(b)) = (&entity.country, &event.country) {
                if a != b {
                    continue;
                }
            }
            if let (Some(a), Some(b)) = (entity.domain(), event_domain) {
                if a != b {
                    continue;
                }
            }

            let score = self
                .matcher
                .similarity(&entity.normalized_name, &event.normalized_name);
            // Strict comparison keeps the earliest entity on ties
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, idx));
            }
        }

        match best {
            Some((score, idx)) if score >= self.similarity_threshold => Some(idx),
            _ => None,
        }
    }

    /// Attach an event to an entity: span first/last seen, fill missing
    /// attributes, record the event ref, union unowned identifiers.
    fn attach(&mut self, idx: usize, event: &CanonicalFundingEvent) -> Vec<ResolutionConflict> {
        let event_ref = EventRef {
            source: event.source,
            source_record_id: event.source_record_id.clone(),
        };

        let conflicts = self.union_identifiers(idx, event, &event_ref);

        let entity = &mut self.entities[idx];
        if event.event_date < entity.first_seen {
            entity.first_seen = event.event_date;
        }
        if event.event_date > entity.last_seen {
            entity.last_seen = event.event_date;
        }
        if entity.country.is_none() {
            entity.country = event.country.clone();
        }
        if entity.industry.is_none() {
            entity.industry = event.industry.clone();
        }
        // Re-ingesting the same record must not duplicate the reference
        if !entity.events.contains(&event_ref) {
            entity.events.push(event_ref);
        }

        conflicts
    }

    /// First-writer-wins union of the event's identifiers into the entity.
    /// A value owned by a *different* entity stays there; the claim is
    /// logged and reported, never applied.
    fn union_identifiers(
        &mut self,
        idx: usize,
        event: &CanonicalFundingEvent,
        event_ref: &EventRef,
    ) -> Vec<ResolutionConflict> {
        let mut conflicts = Vec::new();
        for ident in &event.identifiers {
            match self.owner.get(ident) {
                None => {
                    self.owner.insert(ident.clone(), idx);
                    self.entities[idx].identifiers.insert(ident.clone());
                }
                Some(&owner_idx) if owner_idx == idx => {}
                Some(&owner_idx) => {
                    let conflict = ResolutionConflict {
                        identifier: ident.clone(),
                        owner: self.entities[owner_idx].id.clone(),
                        claimant: self.entities[idx].id.clone(),
                        event: event_ref.clone(),
                    };
                    tracing::warn!(
                        kind = ident.kind.as_str(),
                        value = %ident.value,
                        owner = %conflict.owner,
                        claimant = %conflict.claimant,
                        "identifier already owned by another entity, keeping first owner"
                    );
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{normalize_company_name, FundingType};
    use std::collections::HashSet;

    fn event(
        name: &str,
        date: &str,
        identifiers: Vec<Identifier>,
        record_id: &str,
    ) -> CanonicalFundingEvent {
        CanonicalFundingEvent {
            company_name: name.to_string(),
            normalized_name: normalize_company_name(name),
            funding_type: FundingType::Grant,
            source_label: "US_GRANT".to_string(),
            amount_usd: 100_000.0,
            original_amount: 100_000.0,
            original_currency: "USD".to_string(),
            event_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            source: SourceId::UsaSpending,
            source_record_id: record_id.to_string(),
            identifiers,
            industry: None,
            country: Some("US".to_string()),
        }
    }

    fn uei(value: &str) -> Identifier {
        Identifier::new(IdentifierKind::Uei, value)
    }

    #[test]
    fn test_new_entity_created_without_signal() {
        let mut registry = EntityRegistry::new();
        let res = registry.resolve(&event("Acme Robotics", "2024-01-01", vec![], "R1"));
        assert!(res.is_new_entity);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_uei_different_spellings_merge() {
        let mut registry = EntityRegistry::new();
        let first = registry.resolve(&event(
            "Acme Robotics, Inc.",
            "2023-05-01",
            vec![uei("UEI-XYZ")],
            "R1",
        ));
        let second = registry.resolve(&event(
            "ACME ROBOTICS INCORPORATED",
            "2024-02-01",
            vec![uei("UEI-XYZ")],
            "R2",
        ));

        assert!(first.is_new_entity);
        assert!(!second.is_new_entity);
        assert_eq!(first.entity_id, second.entity_id);

        let entity = registry.get(&first.entity_id).unwrap();
        assert_eq!(entity.first_seen, NaiveDate::from_ymd_opt(2023, 5, 1).unwrap());
        assert_eq!(entity.last_seen, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(entity.events.len(), 2);
    }

    #[test]
    fn test_identifier_never_owned_by_two_entities() {
        let mut registry = EntityRegistry::new();
        // Entity A owns the UEI, entity B owns the DUNS
        let a = registry.resolve(&event("Alpha Dynamics", "2024-01-01", vec![uei("UEI-A")], "R1"));
        let b = registry.resolve(&event(
            "Zeta Microscopy",
            "2024-01-02",
            vec![Identifier::new(IdentifierKind::Duns, "111")],
            "R2",
        ));
        assert_ne!(a.entity_id, b.entity_id);

        // Event matches A by UEI but also claims B's DUNS
        let res = registry.resolve(&event(
            "Alpha Dynamics",
            "2024-03-01",
            vec![uei("UEI-A"), Identifier::new(IdentifierKind::Duns, "111")],
            "R3",
        ));
        assert_eq!(res.entity_id, a.entity_id);
        assert_eq!(res.conflicts.len(), 1);
        assert_eq!(res.conflicts[0].identifier.value, "111");
        assert_eq!(res.conflicts[0].owner, b.entity_id);

        // Invariant: no identifier value appears in two entities
        let mut seen: HashSet<&Identifier> = HashSet::new();
        for entity in registry.entities() {
            for ident in &entity.identifiers {
                assert!(seen.insert(ident), "identifier {ident:?} owned twice");
            }
        }
        // And the DUNS stayed with its first owner
        let b_entity = registry.get(&b.entity_id).unwrap();
        assert!(b_entity
            .identifiers
            .contains(&Identifier::new(IdentifierKind::Duns, "111")));
    }

    #[test]
    fn test_heuristic_match_on_similar_name() {
        let mut registry = EntityRegistry::new();
        let first = registry.resolve(&event("Nova Bio Labs LLC", "2024-01-01", vec![], "R1"));
        // No identifiers, but normalizes to the same name
        let second = registry.resolve(&event("Nova Bio Labs", "2024-02-01", vec![], "R2"));
        assert!(!second.is_new_entity);
        assert_eq!(first.entity_id, second.entity_id);
    }

    #[test]
    fn test_heuristic_blocked_by_country_mismatch() {
        let mut registry = EntityRegistry::new();
        registry.resolve(&event("Nova Bio Labs", "2024-01-01", vec![], "R1"));

        let mut foreign = event("Nova Bio Labs", "2024-02-01", vec![], "R2");
        foreign.country = Some("CA".to_string());
        let res = registry.resolve(&foreign);
        assert!(res.is_new_entity);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_heuristic_blocked_by_domain_mismatch() {
        let mut registry = EntityRegistry::new();
        registry.resolve(&event(
            "Nova Bio Labs",
            "2024-01-01",
            vec![Identifier::new(IdentifierKind::Domain, "novabio.com")],
            "R1",
        ));

        let res = registry.resolve(&event(
            "Nova Bio Labs",
            "2024-02-01",
            vec![Identifier::new(IdentifierKind::Domain, "novabiolabs.io")],
            "R2",
        ));
        assert!(res.is_new_entity);
    }

    #[test]
    fn test_dissimilar_names_stay_distinct() {
        let mut registry = EntityRegistry::new();
        registry.resolve(&event("Acme Robotics", "2024-01-01", vec![], "R1"));
        let res = registry.resolve(&event("Nova Bio Labs", "2024-01-02", vec![], "R2"));
        assert!(res.is_new_entity);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reresolving_same_event_is_idempotent() {
        let mut registry = EntityRegistry::new();
        let ev = event("Acme Robotics", "2024-01-01", vec![uei("UEI-A")], "R1");
        let first = registry.resolve(&ev);
        let second = registry.resolve(&ev);

        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(registry.len(), 1);
        let entity = registry.get(&first.entity_id).unwrap();
        assert_eq!(entity.events.len(), 1, "event ref must not duplicate");
    }

    #[test]
    fn test_insert_existing_restores_ownership() {
        let mut registry = EntityRegistry::new();
        let id = registry
            .resolve(&event("Acme Robotics", "2024-01-01", vec![uei("UEI-A")], "R1"))
            .entity_id;
        let saved: Vec<CompanyEntity> = registry.entities().cloned().collect();

        let mut restored = EntityRegistry::new();
        for entity in saved {
            restored.insert_existing(entity);
        }
        let res = restored.resolve(&event("Totally Different", "2024-06-01", vec![uei("UEI-A")], "R9"));
        assert_eq!(res.entity_id, id, "restored registry must honor prior ownership");
    }

    #[test]
    fn test_levenshtein_similarity_scores() {
        let matcher = LevenshteinSimilarity;
        assert_eq!(matcher.similarity("acme robotics", "acme robotics"), 1.0);
        assert_eq!(matcher.similarity("", "acme"), 0.0);
        assert!(matcher.similarity("acme robotics", "acme robotic") > 0.9);
        assert!(matcher.similarity("acme robotics", "nova bio labs") < 0.4);
    }

    #[test]
    fn test_acronym_detection() {
        assert!(is_acronym_match("abc", "applied biological computing"));
        assert!(is_acronym_match("applied biological computing", "abc"));
        // Two-letter acronyms are too weak a signal
        assert!(!is_acronym_match("bm", "business machines"));
        assert!(!is_acronym_match("acme", "nova bio labs"));
    }

    #[test]
    fn test_similarity_is_deterministic() {
        let matcher = LevenshteinSimilarity;
        let a = matcher.similarity("acme robotics", "acme robotix");
        let b = matcher.similarity("acme robotics", "acme robotix");
        assert_eq!(a, b);
    }
}
