use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Budget category a node charges against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    System,
    Journal,
    Memory,
    Research,
    Reflection,
    Growth,
    Curiosity,
    Creative,
    Dream,
    Chat,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Self::System,
        Self::Journal,
        Self::Memory,
        Self::Research,
        Self::Reflection,
        Self::Growth,
        Self::Curiosity,
        Self::Creative,
        Self::Dream,
        Self::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Journal => "journal",
            Self::Memory => "memory",
            Self::Research => "research",
            Self::Reflection => "reflection",
            Self::Growth => "growth",
            Self::Curiosity => "curiosity",
            Self::Creative => "creative",
            Self::Dream => "dream",
            Self::Chat => "chat",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse cost bucket whose heuristic estimate gates admission until the
/// executor reports actuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Free,
    Light,
    Session,
    Research,
    Dream,
}

impl CostClass {
    pub fn default_cost(&self) -> f64 {
        match self {
            Self::Free => 0.0,
            Self::Light => 0.03,
            Self::Session => 0.15,
            Self::Research => 0.30,
            Self::Dream => 0.20,
        }
    }

    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            Self::Free => 5,
            Self::Light => 30,
            Self::Session => 600,
            Self::Research => 1200,
            Self::Dream => 900,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Light => "light",
            Self::Session => "session",
            Self::Research => "research",
            Self::Dream => "dream",
        }
    }
}

/// Dispatch priority. Lower rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Idle,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Idle => 4,
        }
    }

    /// Priorities allowed to draw from the reserve pool.
    pub fn may_draw_reserve(&self) -> bool {
        self.rank() <= Self::High.rank()
    }
}

/// Pending budget hold, identified by token. Settled or released exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: Uuid,
    pub node_id: String,
    pub category: Category,
    pub amount: f64,
    pub from_reserve: f64,
    pub day_epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CategoryLedger {
    pub allocated: f64,
    pub reserved: f64,
    pub spent: f64,
}

impl CategoryLedger {
    pub fn remaining(&self) -> f64 {
        self.allocated - self.reserved - self.spent
    }
}

/// One day's budget book: per-category lines plus the reserve pool and the
/// set of live reservations. Serialized whole for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub day_epoch: i64,
    pub daily_budget: f64,
    pub reserve_pool: f64,
    pub reserve_drawn: f64,
    pub categories: BTreeMap<Category, CategoryLedger>,
    pub reservations: Vec<ReservationToken>,
    pub tokens_spent: u64,
}

impl BudgetLedger {
    pub fn new(day_epoch: i64, daily_budget: f64, allocations: &BTreeMap<Category, f64>, reserve_fraction: f64) -> Self {
        let categories = allocations
            .iter()
            .map(|(cat, frac)| {
                (*cat, CategoryLedger { allocated: daily_budget * frac, reserved: 0.0, spent: 0.0 })
            })
            .collect();
        Self {
            day_epoch,
            daily_budget,
            reserve_pool: daily_budget * reserve_fraction,
            reserve_drawn: 0.0,
            categories,
            reservations: Vec::new(),
            tokens_spent: 0,
        }
    }

    pub fn spent_total(&self) -> f64 {
        self.categories.values().map(|c| c.spent).sum()
    }

    pub fn reserved_total(&self) -> f64 {
        self.categories.values().map(|c| c.reserved).sum()
    }

    pub fn live_from_reserve(&self) -> f64 {
        self.reservations.iter().map(|r| r.from_reserve).sum()
    }

    pub fn global_remaining(&self) -> f64 {
        self.daily_budget - self.spent_total() - self.reserved_total() - self.live_from_reserve()
    }

    fn reserve_remaining(&self) -> f64 {
        self.reserve_pool - self.reserve_drawn - self.live_from_reserve()
    }
}

/// Why a reservation was denied. The `reason` string is stable for events
/// and API payloads.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BudgetDenied {
    #[error("category {category} exhausted: needs {needed:.4}, {remaining:.4} left")]
    Category { category: Category, needed: f64, remaining: f64 },
    #[error("daily budget exhausted: needs {needed:.4}, {remaining:.4} left")]
    Global { needed: f64, remaining: f64 },
    #[error("unknown category {0}")]
    UnknownCategory(Category),
}

impl BudgetDenied {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Category { .. } => "category",
            Self::Global { .. } => "global",
            Self::UnknownCategory(_) => "unknown_category",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub daily_budget_usd: f64,
    pub category_allocations: BTreeMap<Category, f64>,
    pub reserve_fraction: f64,
}

/// Tracks token and dollar spend against daily and per-category caps and
/// issues spend reservations. All operations are short and non-awaiting;
/// persistence of the ledger is the caller's job after mutations.
pub struct BudgetManager {
    inner: Mutex<BudgetLedger>,
    config: Mutex<BudgetConfig>,
}

impl BudgetManager {
    /// Start from a persisted ledger when one exists for the current day,
    /// otherwise open a fresh one.
    pub fn new(config: BudgetConfig, day_epoch: i64, restored: Option<BudgetLedger>) -> Self {
        let ledger = match restored {
            Some(ledger) if ledger.day_epoch == day_epoch => ledger,
            _ => BudgetLedger::new(
                day_epoch,
                config.daily_budget_usd,
                &config.category_allocations,
                config.reserve_fraction,
            ),
        };
        Self { inner: Mutex::new(ledger), config: Mutex::new(config) }
    }

    pub fn reserve(
        &self,
        node_id: &str,
        category: Category,
        cost_class: CostClass,
        priority: Priority,
        est_cost: Option<f64>,
    ) -> Result<ReservationToken, BudgetDenied> {
        let amount = est_cost.unwrap_or_else(|| cost_class.default_cost());
        let mut ledger = self.inner.lock().expect("budget lock");

        let line = ledger
            .categories
            .get(&category)
            .ok_or(BudgetDenied::UnknownCategory(category))?;

        // Category admission is exhaustion-based: a positive remainder admits
        // the estimate even if it overshoots, the next caller sees the
        // category exhausted. Priority >= high may fund an exhausted category
        // from the reserve pool instead.
        let remaining = line.remaining();
        let mut from_reserve = 0.0;
        if amount > 0.0 && remaining <= 0.0 {
            if priority.may_draw_reserve() && ledger.reserve_remaining() >= amount {
                from_reserve = amount;
            } else {
                return Err(BudgetDenied::Category {
                    category,
                    needed: amount,
                    remaining: remaining.max(0.0),
                });
            }
        }

        // The daily cap is strict: live holds plus settled spend never exceed
        // it (reserve draws are accounted on top via reserve_drawn).
        let global_remaining = ledger.global_remaining();
        if amount > 0.0 && amount - from_reserve > global_remaining {
            return Err(BudgetDenied::Global { needed: amount, remaining: global_remaining.max(0.0) });
        }

        let token = ReservationToken {
            id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            category,
            amount,
            from_reserve,
            day_epoch: ledger.day_epoch,
        };
        let line = ledger.categories.get_mut(&category).expect("category checked above");
        line.reserved += amount - from_reserve;
        ledger.reservations.push(token.clone());
        Ok(token)
    }

    /// Release the hold and record the actual spend under the category.
    pub fn settle(&self, token: &ReservationToken, actual_cost: f64, tokens_used: u64) {
        let mut ledger = self.inner.lock().expect("budget lock");
        if !Self::take_reservation(&mut ledger, token) {
            tracing::warn!(reservation = %token.id, "settle for unknown reservation ignored");
            return;
        }
        if let Some(line) = ledger.categories.get_mut(&token.category) {
            line.spent += (actual_cost - token.from_reserve).max(0.0);
        }
        ledger.reserve_drawn += token.from_reserve.min(actual_cost);
        ledger.tokens_spent += tokens_used;
    }

    /// Release the hold without recording spend, apart from an optional
    /// minimum charge when an LLM call had already gone out.
    pub fn release(&self, token: &ReservationToken, minimum_charge: f64) {
        if minimum_charge > 0.0 {
            self.settle(token, minimum_charge.min(token.amount), 0);
            return;
        }
        let mut ledger = self.inner.lock().expect("budget lock");
        if !Self::take_reservation(&mut ledger, token) {
            tracing::warn!(reservation = %token.id, "release for unknown reservation ignored");
        }
    }

    fn take_reservation(ledger: &mut BudgetLedger, token: &ReservationToken) -> bool {
        let Some(pos) = ledger.reservations.iter().position(|r| r.id == token.id) else {
            return false;
        };
        let live = ledger.reservations.remove(pos);
        if let Some(line) = ledger.categories.get_mut(&live.category) {
            line.reserved -= live.amount - live.from_reserve;
        }
        true
    }

    /// True while the token's hold is still live (used to ignore late writes
    /// from cancelled executors).
    pub fn is_live(&self, token: &ReservationToken) -> bool {
        let ledger = self.inner.lock().expect("budget lock");
        ledger.reservations.iter().any(|r| r.id == token.id)
    }

    pub fn remaining(&self, category: Option<Category>) -> f64 {
        let ledger = self.inner.lock().expect("budget lock");
        match category {
            Some(cat) => ledger.categories.get(&cat).map(|c| c.remaining().max(0.0)).unwrap_or(0.0),
            None => ledger.global_remaining().max(0.0),
        }
    }

    pub fn snapshot(&self) -> BudgetLedger {
        self.inner.lock().expect("budget lock").clone()
    }

    pub fn day_epoch(&self) -> i64 {
        self.inner.lock().expect("budget lock").day_epoch
    }

    /// Replace caps at runtime; takes effect immediately for unreserved
    /// allowance and shapes every subsequent rollover.
    pub fn reconfigure(&self, config: BudgetConfig) {
        let mut ledger = self.inner.lock().expect("budget lock");
        ledger.daily_budget = config.daily_budget_usd;
        ledger.reserve_pool = config.daily_budget_usd * config.reserve_fraction;
        for (cat, frac) in &config.category_allocations {
            let line = ledger.categories.entry(*cat).or_default();
            line.allocated = config.daily_budget_usd * frac;
        }
        *self.config.lock().expect("budget config lock") = config;
    }

    /// Close the prior ledger at a day_epoch change and open the next one.
    /// Unfinished reservations migrate to the new day under the same node id.
    /// Unspent reserve is dropped, not carried.
    pub fn roll_day(&self, new_epoch: i64) -> BudgetLedger {
        let config = self.config.lock().expect("budget config lock").clone();
        let mut ledger = self.inner.lock().expect("budget lock");
        let mut fresh = BudgetLedger::new(
            new_epoch,
            config.daily_budget_usd,
            &config.category_allocations,
            config.reserve_fraction,
        );
        for reservation in ledger.reservations.drain(..) {
            let mut migrated = reservation;
            migrated.day_epoch = new_epoch;
            if let Some(line) = fresh.categories.get_mut(&migrated.category) {
                line.reserved += migrated.amount - migrated.from_reserve;
            }
            fresh.reservations.push(migrated);
        }
        std::mem::replace(&mut *ledger, fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(daily: f64) -> BudgetConfig {
        let mut allocations = BTreeMap::new();
        allocations.insert(Category::Research, 0.5);
        allocations.insert(Category::System, 0.2);
        allocations.insert(Category::Dream, 0.2);
        BudgetConfig {
            daily_budget_usd: daily,
            category_allocations: allocations,
            reserve_fraction: 0.1,
        }
    }

    fn manager(daily: f64) -> BudgetManager {
        BudgetManager::new(config(daily), 100, None)
    }

    mod reserve_tests {
        use super::*;

        /// Two back-to-back research dispatches fit a half-allocated $1.00
        /// day; the third finds the category exhausted.
        #[test]
        fn two_research_reservations_fit_then_third_denied() {
            let budget = manager(1.0);
            let a = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::Normal, None)
                .unwrap();
            budget.settle(&a, 0.30, 900);
            let b = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::Normal, None)
                .unwrap();
            budget.settle(&b, 0.30, 900);

            let denied = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::Normal, None)
                .unwrap_err();
            assert_eq!(denied.reason(), "category");
        }

        #[test]
        fn free_class_always_admitted() {
            let budget = manager(1.0);
            // exhaust the system category
            let hold = budget
                .reserve("system.github_metrics", Category::System, CostClass::Session, Priority::Normal, Some(0.2))
                .unwrap();
            budget.settle(&hold, 0.2, 0);
            let token = budget
                .reserve("system.github_metrics", Category::System, CostClass::Free, Priority::Normal, None)
                .unwrap();
            assert_eq!(token.amount, 0.0);
        }

        #[test]
        fn critical_draws_reserve_when_category_exhausted() {
            let budget = manager(1.0);
            let hold = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::Normal, Some(0.5))
                .unwrap();
            budget.settle(&hold, 0.5, 0);

            let token = budget
                .reserve("research.urgent", Category::Research, CostClass::Light, Priority::Critical, Some(0.05))
                .unwrap();
            assert!(token.from_reserve > 0.0);
            budget.settle(&token, 0.05, 0);
            assert!((budget.snapshot().reserve_drawn - 0.05).abs() < 1e-9);
        }

        #[test]
        fn normal_priority_cannot_draw_reserve() {
            let budget = manager(1.0);
            let hold = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::Normal, Some(0.5))
                .unwrap();
            budget.settle(&hold, 0.5, 0);

            let denied = budget
                .reserve("research.more", Category::Research, CostClass::Light, Priority::Normal, None)
                .unwrap_err();
            assert_eq!(denied.reason(), "category");
        }
    }

    mod conservation_tests {
        use super::*;

        /// Settled spend plus live reservations never exceeds the cap plus
        /// drawn reserve, across a mixed reserve/settle/release sequence.
        #[test]
        fn budget_conserved_across_mixed_operations() {
            let budget = manager(2.0);
            let mut live = Vec::new();
            for i in 0..6 {
                let node = format!("research.batch_{i}");
                match budget.reserve(&node, Category::Research, CostClass::Light, Priority::Normal, None) {
                    Ok(token) => live.push(token),
                    Err(_) => break,
                }
            }
            let settled = live.split_off(live.len() / 2);
            for token in &settled {
                budget.settle(token, 0.04, 100);
            }
            for token in &live {
                budget.release(token, 0.0);
            }

            let ledger = budget.snapshot();
            let total = ledger.spent_total() + ledger.reserved_total();
            assert!(total <= ledger.daily_budget + ledger.reserve_drawn + 1e-9);
            assert_eq!(ledger.tokens_spent, 100 * settled.len() as u64);
        }

        #[test]
        fn release_with_minimum_charge_records_partial_spend() {
            let budget = manager(1.0);
            let token = budget
                .reserve("dream.nightly", Category::Dream, CostClass::Dream, Priority::Normal, None)
                .unwrap();
            budget.release(&token, 0.01);
            let ledger = budget.snapshot();
            assert!((ledger.categories[&Category::Dream].spent - 0.01).abs() < 1e-9);
            assert_eq!(ledger.reservations.len(), 0);
        }

        #[test]
        fn double_settle_is_ignored() {
            let budget = manager(1.0);
            let token = budget
                .reserve("system.tick", Category::System, CostClass::Light, Priority::Normal, None)
                .unwrap();
            budget.settle(&token, 0.03, 10);
            budget.settle(&token, 0.03, 10);
            let ledger = budget.snapshot();
            assert!((ledger.categories[&Category::System].spent - 0.03).abs() < 1e-9);
            assert_eq!(ledger.tokens_spent, 10);
        }
    }

    mod rollover_tests {
        use super::*;

        #[test]
        fn rollover_archives_and_resets() {
            let budget = manager(1.0);
            let token = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::Normal, None)
                .unwrap();
            let archived = budget.roll_day(101);
            assert_eq!(archived.day_epoch, 100);
            let fresh = budget.snapshot();
            assert_eq!(fresh.day_epoch, 101);
            assert_eq!(fresh.spent_total(), 0.0);
            // the unfinished reservation migrated
            assert_eq!(fresh.reservations.len(), 1);
            assert_eq!(fresh.reservations[0].node_id, "research.wiki_page");
            budget.settle(&token, 0.3, 0);
            assert_eq!(budget.snapshot().reservations.len(), 0);
        }

        #[test]
        fn reserve_is_not_carried_over() {
            let budget = manager(1.0);
            let hold = budget
                .reserve("research.wiki_page", Category::Research, CostClass::Research, Priority::High, Some(0.6))
                .unwrap();
            budget.settle(&hold, 0.6, 0);
            budget.roll_day(101);
            let fresh = budget.snapshot();
            assert!((fresh.reserve_pool - 0.1).abs() < 1e-9);
            assert_eq!(fresh.reserve_drawn, 0.0);
        }
    }
}
