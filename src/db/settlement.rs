use std::collections::HashMap;

use rust_decimal::Decimal;

use super::{DbPool, DbResult};

/// Batched applier of aggregated costs. The spend worker is the only
/// caller, which makes this the sole writer of `budget_used` and
/// `credits`.
pub struct SettlementWriter {
    pool: DbPool,
    credits_per_cost_unit: Decimal,
}

impl SettlementWriter {
    pub fn new(pool: DbPool, credits_per_cost_unit: u64) -> Self {
        Self {
            pool,
            credits_per_cost_unit: Decimal::from(credits_per_cost_unit),
        }
    }

    /// `budget_used += cost` and `credits -= cost * multiplier` for every
    /// account in one multi-row UPDATE.
    pub async fn update_account_budgets(&self, costs: &HashMap<i64, Decimal>) -> DbResult<()> {
        if costs.is_empty() {
            return Ok(());
        }
        let (ids, amounts) = split_costs(costs);
        sqlx::query(
            r#"
            UPDATE accounts AS a
            SET budget_used = a.budget_used + v.cost,
                credits = a.credits - v.cost * $3
            FROM (SELECT unnest($1::bigint[]) AS id, unnest($2::numeric[]) AS cost) AS v
            WHERE a.id = v.id
            "#,
        )
        .bind(&ids)
        .bind(&amounts)
        .bind(self.credits_per_cost_unit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `budget_used += cost` for every key in one multi-row UPDATE.
    pub async fn update_key_budgets(&self, costs: &HashMap<i64, Decimal>) -> DbResult<()> {
        if costs.is_empty() {
            return Ok(());
        }
        let (ids, amounts) = split_costs(costs);
        sqlx::query(
            r#"
            UPDATE api_keys AS k
            SET budget_used = k.budget_used + v.cost
            FROM (SELECT unnest($1::bigint[]) AS id, unnest($2::numeric[]) AS cost) AS v
            WHERE k.id = v.id
            "#,
        )
        .bind(&ids)
        .bind(&amounts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn split_costs(costs: &HashMap<i64, Decimal>) -> (Vec<i64>, Vec<Decimal>) {
    let mut ids = Vec::with_capacity(costs.len());
    let mut amounts = Vec::with_capacity(costs.len());
    for (id, cost) in costs {
        ids.push(*id);
        amounts.push(*cost);
    }
    (ids, amounts)
}
