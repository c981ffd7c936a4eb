use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::new_uuid_v7;
use crate::time::watermark_after;

/// Tolerance for `total == income - payments` after floating-point accumulation.
pub const TOTAL_TOLERANCE: f64 = 1e-9;

/// Aggregate figures shared by house and group pivotals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pivotal {
    pub id: String,
    pub income: f64,
    pub payments: f64,
    pub total: f64,
    /// Newest contributing income date plus one microsecond; `None` until an
    /// income has contributed.
    pub latest_income_update_date: Option<DateTime<Utc>>,
    pub latest_payment_update_date: Option<DateTime<Utc>>,
}

impl Default for Pivotal {
    fn default() -> Self {
        Self::new()
    }
}

impl Pivotal {
    /// Fresh id, zero sums, no watermarks.
    pub fn new() -> Self {
        Self {
            id: new_uuid_v7(),
            income: 0.0,
            payments: 0.0,
            total: 0.0,
            latest_income_update_date: None,
            latest_payment_update_date: None,
        }
    }

    pub fn add_payment(&mut self, sum: f64) {
        self.payments += sum;
        self.total -= sum;
    }

    pub fn add_income(&mut self, sum: f64) {
        self.income += sum;
        self.total += sum;
    }

    /// Fold payments that arrive newest first: the first one sets the watermark.
    pub fn fold_payments<'a>(&mut self, newest_first: impl IntoIterator<Item = &'a PaymentDto>) {
        for (index, payment) in newest_first.into_iter().enumerate() {
            if index == 0 {
                self.latest_payment_update_date = Some(watermark_after(payment.date));
            }
            self.add_payment(payment.sum);
        }
    }

    pub fn fold_incomes<'a>(&mut self, newest_first: impl IntoIterator<Item = &'a IncomeDto>) {
        for (index, income) in newest_first.into_iter().enumerate() {
            if index == 0 {
                self.latest_income_update_date = Some(watermark_after(income.date));
            }
            self.add_income(income.sum);
        }
    }

    /// Accumulate deltas gathered since the current watermarks.
    pub fn apply(&mut self, income: &Delta, payments: &Delta) {
        self.income += income.sum;
        self.payments += payments.sum;
        self.total = self.income - self.payments;
        if let Some(latest) = income.latest {
            self.latest_income_update_date = Some(watermark_after(latest));
        }
        if let Some(latest) = payments.latest {
            self.latest_payment_update_date = Some(watermark_after(latest));
        }
    }

    pub fn total_is_consistent(&self) -> bool {
        (self.total - (self.income - self.payments)).abs() <= TOTAL_TOLERANCE
    }

    /// Equal figures and watermarks; ids are ignored.
    pub fn same_figures(&self, other: &Pivotal) -> bool {
        (self.income - other.income).abs() <= TOTAL_TOLERANCE
            && (self.payments - other.payments).abs() <= TOTAL_TOLERANCE
            && (self.total - other.total).abs() <= TOTAL_TOLERANCE
            && self.latest_income_update_date == other.latest_income_update_date
            && self.latest_payment_update_date == other.latest_payment_update_date
    }
}

/// Read-only view over the two keyed pivotal variants.
pub trait PivotalSource {
    fn pivotal(&self) -> &Pivotal;
    fn source_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousePivotal {
    #[serde(flatten)]
    pub pivotal: Pivotal,
    pub house_id: String,
}

impl HousePivotal {
    pub fn new(house_id: impl Into<String>) -> Self {
        Self {
            pivotal: Pivotal::new(),
            house_id: house_id.into(),
        }
    }
}

impl PivotalSource for HousePivotal {
    fn pivotal(&self) -> &Pivotal {
        &self.pivotal
    }

    fn source_id(&self) -> &str {
        &self.house_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPivotal {
    #[serde(flatten)]
    pub pivotal: Pivotal,
    pub group_id: String,
}

impl GroupPivotal {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            pivotal: Pivotal::new(),
            group_id: group_id.into(),
        }
    }
}

impl PivotalSource for GroupPivotal {
    fn pivotal(&self) -> &Pivotal {
        &self.pivotal
    }

    fn source_id(&self) -> &str {
        &self.group_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalPivotal {
    pub income: f64,
    pub payments: f64,
    pub total: f64,
}

impl TotalPivotal {
    /// House figures when the house has no groups, otherwise the sum over
    /// its groups. Ungrouped house records are not part of a grouped total.
    pub fn for_response(house: &HousePivotal, groups: &[GroupPivotal]) -> Self {
        if groups.is_empty() {
            let p = &house.pivotal;
            return Self {
                income: p.income,
                payments: p.payments,
                total: p.income - p.payments,
            };
        }
        groups.iter().fold(Self::default(), |acc, group| {
            let p = &group.pivotal;
            Self {
                income: acc.income + p.income,
                payments: acc.payments + p.payments,
                total: acc.total + (p.income - p.payments),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotalResponse {
    pub house: HousePivotal,
    pub groups: Vec<GroupPivotal>,
    pub total: TotalPivotal,
}

/// Sum of matching records after a watermark, with the newest date among them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Delta {
    pub sum: f64,
    pub latest: Option<DateTime<Utc>>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.latest.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<GroupRef>,
}

impl HouseDto {
    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDto {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDto {
    pub id: String,
    pub house_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub sum: f64,
    pub date: DateTime<Utc>,
}

/// An income belongs to one house, or to one or more groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "ids")]
pub enum IncomeScope {
    House(String),
    Groups(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house_id: Option<String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub sum: f64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub house_id: String,
    pub name: String,
    pub description: Option<String>,
    pub sum: f64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIncome {
    pub scope: IncomeScope,
    pub name: String,
    pub description: Option<String>,
    pub sum: f64,
    pub date: DateTime<Utc>,
}

/// Fields an update may change. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmountUpdate {
    pub name: Option<String>,
    pub sum: Option<f64>,
    pub date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payment(sum: f64, day: u32) -> PaymentDto {
        PaymentDto {
            id: new_uuid_v7(),
            house_id: "h".into(),
            name: "bill".into(),
            description: None,
            sum,
            date: Utc.with_ymd_and_hms(2021, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn fold_uses_first_item_as_watermark() {
        let mut p = Pivotal::new();
        let newest_first = [payment(50.0, 5), payment(100.0, 1)];
        p.fold_payments(&newest_first);
        assert_eq!(p.payments, 150.0);
        assert_eq!(p.total, -150.0);
        assert_eq!(
            p.latest_payment_update_date,
            Some(watermark_after(newest_first[0].date))
        );
        assert!(p.latest_income_update_date.is_none());
        assert!(p.total_is_consistent());
    }

    #[test]
    fn apply_accumulates_onto_prior_figures() {
        let mut p = Pivotal::new();
        p.add_income(250.0);
        p.add_payment(100.0);
        let latest = Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap();
        p.apply(
            &Delta {
                sum: 30.0,
                latest: Some(latest),
            },
            &Delta::default(),
        );
        assert_eq!(p.income, 280.0);
        assert_eq!(p.payments, 100.0);
        assert_eq!(p.total, 180.0);
        assert_eq!(p.latest_income_update_date, Some(watermark_after(latest)));
        assert!(p.latest_payment_update_date.is_none());
    }

    #[test]
    fn response_total_prefers_groups() {
        let mut house = HousePivotal::new("h");
        house.pivotal.add_income(10.0);
        assert_eq!(
            TotalPivotal::for_response(&house, &[]),
            TotalPivotal {
                income: 10.0,
                payments: 0.0,
                total: 10.0
            }
        );

        let mut g1 = GroupPivotal::new("g1");
        g1.pivotal.add_income(700.0);
        g1.pivotal.add_payment(300.0);
        let mut g2 = GroupPivotal::new("g2");
        g2.pivotal.add_payment(5.0);
        let total = TotalPivotal::for_response(&house, &[g1, g2]);
        assert_eq!(total.income, 700.0);
        assert_eq!(total.payments, 305.0);
        assert_eq!(total.total, 395.0);
    }

    #[test]
    fn house_pivotal_serializes_flat() {
        let hp = HousePivotal::new("h1");
        let value = serde_json::to_value(&hp).unwrap();
        assert_eq!(value.get("house_id").and_then(|v| v.as_str()), Some("h1"));
        assert!(value.get("income").is_some());
        assert!(value.get("pivotal").is_none());
    }
}
