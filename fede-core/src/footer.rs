//! Footer selector: weighted random choice of a footer template for a tip.
//!
//! Selection rules, in order:
//! 1. the pool is the active templates;
//! 2. templates used within the cooldown window are excluded, unless that
//!    would empty the pool, in which case the exclusion is skipped;
//! 3. with forced rotation configured, a zero-weight template that is due
//!    (never used, or idle longer than the rotation window) is taken first;
//! 4. otherwise a weighted draw over `probability` (clamped at zero); if every
//!    weight is zero the draw is uniform.
//!
//! The pool is ordered by weight desc, priority desc, least recently used
//! before drawing, so equal weights resolve deterministically for a given
//! random value. Usage bookkeeping is a single atomic store update.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::FooterConfig;
use crate::error::{FedeError, FedeResult};
use crate::models::{FooterPatch, FooterTemplate, FooterType, NewFooter};
use crate::store::FooterStore;

/// A selected footer with its rendered text.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterSelection {
    pub footer: FooterTemplate,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterTypeGroup {
    #[serde(rename = "type")]
    pub footer_type: FooterType,
    pub templates: Vec<FooterTemplate>,
    pub total_probability: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePool {
    pub footers: Vec<FooterTemplate>,
    pub by_type: Vec<FooterTypeGroup>,
    pub total_probability: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterUsage {
    pub id: uuid::Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub footer_type: FooterType,
    pub probability: i32,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterStats {
    pub footers: Vec<FooterUsage>,
    pub total_usage: i64,
    pub total_active_probability: i64,
    pub active_count: usize,
    pub inactive_count: usize,
}

pub struct FooterSelector {
    store: Arc<dyn FooterStore>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    cooldown: Duration,
    force_rotation_after: Option<Duration>,
    enforce_probability_cap: bool,
}

impl FooterSelector {
    pub fn new(store: Arc<dyn FooterStore>, clock: Arc<dyn Clock>, config: &FooterConfig, rng: StdRng) -> Self {
        Self {
            store,
            clock,
            rng: Mutex::new(rng),
            cooldown: Duration::seconds(config.cooldown_seconds as i64),
            force_rotation_after: config
                .force_rotation_after_seconds
                .map(|s| Duration::seconds(s as i64)),
            enforce_probability_cap: config.enforce_probability_cap,
        }
    }

    /// Selector seeded from OS entropy.
    pub fn from_entropy(store: Arc<dyn FooterStore>, clock: Arc<dyn Clock>, config: &FooterConfig) -> Self {
        Self::new(store, clock, config, StdRng::from_entropy())
    }

    /// Pure selection over a candidate list; `roll` maps a bound to a uniform
    /// value in `[0, bound)`.
    pub fn choose<'a>(
        &self,
        templates: &'a [FooterTemplate],
        now: DateTime<Utc>,
        roll: &mut dyn FnMut(u64) -> u64,
    ) -> Option<&'a FooterTemplate> {
        let active: Vec<&FooterTemplate> = templates.iter().filter(|t| t.is_active).collect();
        if active.is_empty() {
            return None;
        }

        let cooled: Vec<&FooterTemplate> = active
            .iter()
            .copied()
            .filter(|t| !self.in_cooldown(t, now))
            .collect();
        let mut pool = if cooled.is_empty() { active } else { cooled };

        if let Some(window) = self.force_rotation_after {
            let due = pool
                .iter()
                .copied()
                .filter(|t| t.weight() == 0)
                .filter(|t| t.last_used_at.map_or(true, |at| now - at >= window))
                .min_by_key(|t| t.last_used_at);
            if let Some(t) = due {
                tracing::debug!(id = %t.id, "Forced footer rotation");
                return Some(t);
            }
        }

        pool.sort_by(|a, b| {
            b.weight()
                .cmp(&a.weight())
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        });

        let total: u64 = pool.iter().map(|t| t.weight() as u64).sum();
        if total == 0 {
            let idx = roll(pool.len() as u64) as usize;
            return pool.get(idx).copied();
        }

        let mut target = roll(total);
        for t in &pool {
            let w = t.weight() as u64;
            if target < w {
                return Some(t);
            }
            target -= w;
        }
        pool.last().copied()
    }

    fn in_cooldown(&self, t: &FooterTemplate, now: DateTime<Utc>) -> bool {
        match t.last_used_at {
            Some(at) => now - at < self.cooldown,
            None => false,
        }
    }

    /// Draw from the active pool and record the use. `None` when no template
    /// is active.
    pub async fn select(&self) -> FedeResult<Option<FooterTemplate>> {
        let templates = self.store.list_active().await?;
        let now = self.clock.now();

        let chosen = {
            let mut rng = self.rng.lock();
            let mut roll = |bound: u64| rng.gen_range(0..bound);
            self.choose(&templates, now, &mut roll).map(|t| t.id)
        };

        let Some(id) = chosen else {
            tracing::debug!("No active footer templates");
            return Ok(None);
        };

        match self.store.mark_used(id, now).await? {
            Some(updated) => Ok(Some(updated)),
            None => {
                // Deleted between listing and marking.
                tracing::warn!(id = %id, "Selected footer vanished before usage update");
                Ok(templates.into_iter().find(|t| t.id == id))
            }
        }
    }

    /// Select and render with the tip's key phrase.
    pub async fn select_rendered(&self, key_phrase: Option<&str>) -> FedeResult<Option<FooterSelection>> {
        Ok(self.select().await?.map(|footer| {
            let text = footer.render(key_phrase);
            FooterSelection { footer, text }
        }))
    }

    pub async fn active_pool(&self) -> FedeResult<ActivePool> {
        let footers = self.store.list_active().await?;
        let mut by_type: Vec<FooterTypeGroup> = Vec::new();
        for f in &footers {
            match by_type.iter_mut().find(|g| g.footer_type == f.footer_type) {
                Some(group) => {
                    group.total_probability += f.weight() as i64;
                    group.templates.push(f.clone());
                }
                None => by_type.push(FooterTypeGroup {
                    footer_type: f.footer_type,
                    templates: vec![f.clone()],
                    total_probability: f.weight() as i64,
                }),
            }
        }
        by_type.sort_by_key(|g| g.footer_type);
        let total_probability = footers.iter().map(|f| f.weight() as i64).sum();
        Ok(ActivePool {
            footers,
            by_type,
            total_probability,
        })
    }

    pub async fn stats(&self) -> FedeResult<FooterStats> {
        let all = self.store.list().await?;
        let total_usage = all.iter().map(|f| f.usage_count).sum();
        let total_active_probability = all
            .iter()
            .filter(|f| f.is_active)
            .map(|f| f.weight() as i64)
            .sum();
        let active_count = all.iter().filter(|f| f.is_active).count();
        let mut footers: Vec<FooterUsage> = all
            .into_iter()
            .map(|f| FooterUsage {
                id: f.id,
                name: f.name,
                footer_type: f.footer_type,
                probability: f.probability,
                usage_count: f.usage_count,
                last_used_at: f.last_used_at,
                is_active: f.is_active,
            })
            .collect();
        footers.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        let inactive_count = footers.len() - active_count;
        Ok(FooterStats {
            footers,
            total_usage,
            total_active_probability,
            active_count,
            inactive_count,
        })
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    pub async fn list(&self) -> FedeResult<Vec<FooterTemplate>> {
        self.store.list().await
    }

    pub async fn get(&self, id: uuid::Uuid) -> FedeResult<FooterTemplate> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| FedeError::not_found(format!("footer {}", id)))
    }

    pub async fn create(&self, input: NewFooter) -> FedeResult<FooterTemplate> {
        let footer = FooterTemplate::from_new(input, self.clock.now());
        validate_footer(&footer)?;
        self.check_cap(&footer).await?;
        self.store.create(&footer).await?;
        tracing::info!(id = %footer.id, name = %footer.name, "Footer template created");
        Ok(footer)
    }

    pub async fn update(&self, id: uuid::Uuid, patch: FooterPatch) -> FedeResult<FooterTemplate> {
        let mut footer = self.get(id).await?;
        patch.apply(&mut footer);
        footer.updated_at = self.clock.now();
        validate_footer(&footer)?;
        self.check_cap(&footer).await?;
        if !self.store.update(&footer).await? {
            return Err(FedeError::not_found(format!("footer {}", id)));
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: uuid::Uuid) -> FedeResult<()> {
        if !self.store.delete(id).await? {
            return Err(FedeError::not_found(format!("footer {}", id)));
        }
        tracing::info!(id = %id, "Footer template deleted");
        Ok(())
    }

    /// With the cap on, the active probability total may not exceed 100.
    async fn check_cap(&self, candidate: &FooterTemplate) -> FedeResult<()> {
        if !self.enforce_probability_cap || !candidate.is_active {
            return Ok(());
        }
        let others: i64 = self
            .store
            .list_active()
            .await?
            .iter()
            .filter(|f| f.id != candidate.id)
            .map(|f| f.weight() as i64)
            .sum();
        let total = others + candidate.weight() as i64;
        if total > 100 {
            return Err(FedeError::invalid(format!(
                "active probability total would be {} (max 100, {} available)",
                total,
                100 - others
            )));
        }
        Ok(())
    }
}

fn validate_footer(footer: &FooterTemplate) -> FedeResult<()> {
    if footer.name.trim().is_empty() {
        return Err(FedeError::invalid("footer name cannot be empty"));
    }
    if footer.name.chars().count() > 100 {
        return Err(FedeError::invalid("footer name is limited to 100 characters"));
    }
    if footer.template.trim().is_empty() {
        return Err(FedeError::invalid("footer template cannot be empty"));
    }
    if !(0..=100).contains(&footer.probability) {
        return Err(FedeError::invalid("probability must be between 0 and 100"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryFooterStore;
    use std::collections::HashMap;

    fn config(cooldown_seconds: u64) -> FooterConfig {
        FooterConfig {
            cooldown_seconds,
            force_rotation_after_seconds: None,
            enforce_probability_cap: false,
        }
    }

    fn new_footer(name: &str, probability: i32) -> NewFooter {
        NewFooter {
            footer_type: FooterType::Reflection,
            name: name.to_string(),
            template: format!("{}: {{frase}}", name),
            urls: Default::default(),
            probability: Some(probability),
            is_active: None,
            priority: None,
            notes: None,
        }
    }

    fn selector(store: Arc<MemoryFooterStore>, clock: Arc<ManualClock>, config: FooterConfig) -> FooterSelector {
        FooterSelector::new(store, clock, &config, StdRng::seed_from_u64(42))
    }

    #[tokio::test]
    async fn weighted_draw_converges_to_normalized_weights() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store.clone(), clock.clone(), config(0));
        for (name, p) in [("a", 10), ("b", 20), ("c", 30), ("d", 40)] {
            sel.create(new_footer(name, p)).await.unwrap();
        }

        let draws = 20_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..draws {
            let f = sel.select().await.unwrap().unwrap();
            *counts.entry(f.name).or_default() += 1;
            clock.advance(Duration::seconds(1));
        }

        for (name, p) in [("a", 0.1), ("b", 0.2), ("c", 0.3), ("d", 0.4)] {
            let observed = counts[name] as f64 / draws as f64;
            assert!((observed - p).abs() < 0.02, "{}: observed {} expected {}", name, observed, p);
        }
    }

    #[tokio::test]
    async fn cooldown_excludes_last_selection() {
        for seed in 0..50 {
            let store = Arc::new(MemoryFooterStore::new());
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let sel = FooterSelector::new(store, clock.clone(), &config(3600), StdRng::seed_from_u64(seed));
            for (name, p) in [("a", 90), ("b", 5), ("c", 5)] {
                sel.create(new_footer(name, p)).await.unwrap();
            }

            let first = sel.select().await.unwrap().unwrap();
            clock.advance(Duration::seconds(1));
            let second = sel.select().await.unwrap().unwrap();
            assert_ne!(second.id, first.id, "seed {}", seed);
        }
    }

    #[tokio::test]
    async fn single_template_ignores_cooldown() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store, clock, config(3600));
        let only = sel.create(new_footer("only", 50)).await.unwrap();

        for _ in 0..3 {
            assert_eq!(sel.select().await.unwrap().unwrap().id, only.id);
        }
    }

    #[tokio::test]
    async fn empty_or_inactive_pool_selects_none() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store, clock, config(0));
        assert!(sel.select().await.unwrap().is_none());

        let mut input = new_footer("off", 50);
        input.is_active = Some(false);
        sel.create(input).await.unwrap();
        assert!(sel.select().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_weights_fall_back_to_uniform() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store, clock.clone(), config(0));
        for name in ["a", "b", "c"] {
            sel.create(new_footer(name, 0)).await.unwrap();
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            let f = sel.select().await.unwrap().unwrap();
            *seen.entry(f.name).or_default() += 1;
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.values().all(|&n| n > 50));
    }

    #[tokio::test]
    async fn forced_rotation_picks_due_zero_weight_template() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cfg = FooterConfig {
            cooldown_seconds: 0,
            force_rotation_after_seconds: Some(86_400),
            enforce_probability_cap: false,
        };
        let sel = selector(store, clock.clone(), cfg);
        sel.create(new_footer("heavy", 100)).await.unwrap();
        let rare = sel.create(new_footer("rare", 0)).await.unwrap();

        // Never used -> due immediately.
        assert_eq!(sel.select().await.unwrap().unwrap().id, rare.id);
        // Now used; not due again until a day passes.
        clock.advance(Duration::hours(1));
        assert_ne!(sel.select().await.unwrap().unwrap().id, rare.id);
        clock.advance(Duration::days(1));
        assert_eq!(sel.select().await.unwrap().unwrap().id, rare.id);
    }

    #[test]
    fn equal_weights_break_ties_by_priority_then_lru() {
        let store = Arc::new(MemoryFooterStore::new());
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let sel = selector(store, clock, config(0));

        let mut low = FooterTemplate::from_new(new_footer("low", 50), now);
        low.priority = 1;
        let mut high_recent = FooterTemplate::from_new(new_footer("high-recent", 50), now);
        high_recent.priority = 5;
        high_recent.last_used_at = Some(now - Duration::minutes(1));
        let mut high_stale = FooterTemplate::from_new(new_footer("high-stale", 50), now);
        high_stale.priority = 5;
        high_stale.last_used_at = Some(now - Duration::days(3));

        let pool = vec![low, high_recent, high_stale];
        // A roll of 0 lands on the first slot of the ordered pool.
        let picked = sel.choose(&pool, now, &mut |_| 0).unwrap();
        assert_eq!(picked.name, "high-stale");
        let picked = sel.choose(&pool, now, &mut |_| 50).unwrap();
        assert_eq!(picked.name, "high-recent");
        let picked = sel.choose(&pool, now, &mut |_| 149).unwrap();
        assert_eq!(picked.name, "low");
    }

    #[tokio::test]
    async fn concurrent_selection_loses_no_updates() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = Arc::new(selector(store.clone(), clock, config(3600)));
        let only = sel.create(new_footer("only", 30)).await.unwrap();

        let mut handles = Vec::with_capacity(1000);
        for _ in 0..1000 {
            let sel = sel.clone();
            handles.push(tokio::spawn(async move { sel.select().await }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap().is_some());
        }

        let stored = sel.get(only.id).await.unwrap();
        assert_eq!(stored.usage_count, 1000);
    }

    #[tokio::test]
    async fn probability_cap_is_enforced_when_enabled() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cfg = FooterConfig {
            enforce_probability_cap: true,
            ..config(0)
        };
        let sel = selector(store, clock, cfg);
        let a = sel.create(new_footer("a", 60)).await.unwrap();
        assert!(matches!(
            sel.create(new_footer("b", 50)).await,
            Err(FedeError::InvalidInput(_))
        ));
        sel.create(new_footer("b", 40)).await.unwrap();

        // Raising `a` past the remaining room fails; lowering it is fine.
        let raise = FooterPatch {
            probability: Some(70),
            ..Default::default()
        };
        assert!(sel.update(a.id, raise).await.is_err());
        let lower = FooterPatch {
            probability: Some(20),
            ..Default::default()
        };
        assert_eq!(sel.update(a.id, lower).await.unwrap().probability, 20);
    }

    #[tokio::test]
    async fn active_pool_groups_by_type() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store, clock, config(0));
        sel.create(new_footer("r1", 10)).await.unwrap();
        sel.create(new_footer("r2", 15)).await.unwrap();
        let mut book = new_footer("libro", 20);
        book.footer_type = FooterType::Book;
        sel.create(book).await.unwrap();

        let pool = sel.active_pool().await.unwrap();
        assert_eq!(pool.total_probability, 45);
        assert_eq!(pool.by_type.len(), 2);
        let reflections = pool
            .by_type
            .iter()
            .find(|g| g.footer_type == FooterType::Reflection)
            .unwrap();
        assert_eq!(reflections.total_probability, 25);

        let stats = sel.stats().await.unwrap();
        assert_eq!(stats.active_count, 3);
        assert_eq!(stats.inactive_count, 0);
        assert_eq!(stats.total_active_probability, 45);
    }

    #[tokio::test]
    async fn edits_never_rewind_usage_counts() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store.clone(), clock, config(0));
        let only = sel.create(new_footer("only", 30)).await.unwrap();

        let stale = store.get(only.id).await.unwrap().unwrap();
        for _ in 0..3 {
            sel.select().await.unwrap().unwrap();
        }
        store.update(&stale).await.unwrap();
        assert_eq!(sel.get(only.id).await.unwrap().usage_count, 3);

        let patch = FooterPatch {
            probability: Some(40),
            ..Default::default()
        };
        let updated = sel.update(only.id, patch).await.unwrap();
        assert_eq!(updated.probability, 40);
        assert_eq!(updated.usage_count, 3);
    }

    #[tokio::test]
    async fn invalid_footers_are_rejected() {
        let store = Arc::new(MemoryFooterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sel = selector(store, clock, config(0));
        assert!(sel.create(new_footer("x", 101)).await.is_err());
        assert!(sel.create(new_footer(" ", 10)).await.is_err());
        assert!(matches!(
            sel.delete(uuid::Uuid::new_v4()).await,
            Err(FedeError::NotFound(_))
        ));
    }
}
