//! Membership types (the products sold) and user memberships (access grants).

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Billing interval for recurring membership types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annually,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Daily => "daily",
            BillingInterval::Weekly => "weekly",
            BillingInterval::Monthly => "monthly",
            BillingInterval::Quarterly => "quarterly",
            BillingInterval::Annually => "annually",
        }
    }

    /// Strict parse. Unknown values are never defaulted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(BillingInterval::Daily),
            "weekly" => Some(BillingInterval::Weekly),
            "monthly" => Some(BillingInterval::Monthly),
            "quarterly" => Some(BillingInterval::Quarterly),
            "annually" => Some(BillingInterval::Annually),
            _ => None,
        }
    }

    /// End of a period of `count` intervals starting at `start`.
    pub fn advance(&self, start: NaiveDate, count: i32) -> NaiveDate {
        let count = count.max(1) as u32;
        let end = match self {
            BillingInterval::Daily => start.checked_add_days(chrono::Days::new(count as u64)),
            BillingInterval::Weekly => start.checked_add_days(chrono::Days::new(7 * count as u64)),
            BillingInterval::Monthly => start.checked_add_months(Months::new(count)),
            BillingInterval::Quarterly => start.checked_add_months(Months::new(count * 3)),
            BillingInterval::Annually => start.checked_add_months(Months::new(count * 12)),
        };
        end.unwrap_or(NaiveDate::MAX)
    }

    /// End of the period beginning at `start` on a schedule anchored at
    /// `anchor`. Month-based periods fall on the anchor's day of month,
    /// clamped in shorter months, so a schedule anchored on the 31st returns
    /// to the 31st after February.
    pub fn period_end(&self, anchor: NaiveDate, start: NaiveDate, count: i32) -> NaiveDate {
        let Some(months) = self.months() else {
            return self.advance(start, count);
        };
        if start < anchor {
            return self.advance(start, count);
        }

        let step = months * count.max(1) as u32;
        let elapsed = (start.year() - anchor.year()) * 12 + start.month() as i32
            - anchor.month() as i32;
        let mut periods = (elapsed.max(0) as u32 / step).saturating_sub(1);
        loop {
            periods += 1;
            match periods
                .checked_mul(step)
                .and_then(|m| anchor.checked_add_months(Months::new(m)))
            {
                Some(end) if end > start => return end,
                Some(_) => {}
                None => return NaiveDate::MAX,
            }
        }
    }

    fn months(&self) -> Option<u32> {
        match self {
            BillingInterval::Daily | BillingInterval::Weekly => None,
            BillingInterval::Monthly => Some(1),
            BillingInterval::Quarterly => Some(3),
            BillingInterval::Annually => Some(12),
        }
    }

    /// Factor that turns one interval's price into a monthly amount.
    pub fn monthly_factor(&self) -> Decimal {
        match self {
            BillingInterval::Daily => Decimal::from(365) / Decimal::from(12),
            BillingInterval::Weekly => Decimal::from(52) / Decimal::from(12),
            BillingInterval::Monthly => Decimal::ONE,
            BillingInterval::Quarterly => Decimal::ONE / Decimal::from(3),
            BillingInterval::Annually => Decimal::ONE / Decimal::from(12),
        }
    }
}

/// A product a customer can subscribe to or buy once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MembershipType {
    pub membership_type_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub features: Vec<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: String,
    pub interval_count: i32,
    pub is_recurring: bool,
    /// Access length in days for one-time purchases. `None` grants lifetime access.
    pub duration_days: Option<i32>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl MembershipType {
    pub fn interval(&self) -> Result<BillingInterval, AppError> {
        BillingInterval::parse(&self.billing_interval).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Membership type {} has unknown billing interval '{}'",
                self.membership_type_id,
                self.billing_interval
            ))
        })
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Input for creating a membership type.
#[derive(Debug, Clone)]
pub struct CreateMembershipType {
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub features: Vec<String>,
    pub price: Decimal,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub interval_count: i32,
    pub is_recurring: bool,
    pub duration_days: Option<i32>,
}

/// User membership status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Suspended,
    Cancelled,
    Expired,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Suspended => "suspended",
            MembershipStatus::Cancelled => "cancelled",
            MembershipStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "suspended" => MembershipStatus::Suspended,
            "cancelled" => MembershipStatus::Cancelled,
            "expired" => MembershipStatus::Expired,
            _ => MembershipStatus::Active,
        }
    }
}

/// A customer's access grant, backed by a subscription or a one-time order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserMembership {
    pub membership_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub membership_type_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub status: String,
    pub starts_utc: DateTime<Utc>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for granting a membership.
#[derive(Debug, Clone)]
pub struct NewMembership {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub membership_type_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub starts_utc: DateTime<Utc>,
    pub expires_utc: Option<DateTime<Utc>>,
}

/// Midnight UTC at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_advance_intervals() {
        let start = date(2025, 1, 31);
        assert_eq!(BillingInterval::Daily.advance(start, 1), date(2025, 2, 1));
        assert_eq!(BillingInterval::Weekly.advance(start, 2), date(2025, 2, 14));
        // Clamped to end of month
        assert_eq!(BillingInterval::Monthly.advance(start, 1), date(2025, 2, 28));
        assert_eq!(BillingInterval::Quarterly.advance(start, 1), date(2025, 4, 30));
        assert_eq!(BillingInterval::Annually.advance(start, 1), date(2026, 1, 31));
    }

    #[test]
    fn test_month_end_anchor_does_not_drift() {
        let anchor = date(2025, 1, 31);
        let monthly = BillingInterval::Monthly;
        let mut start = anchor;
        let mut ends = Vec::new();
        for _ in 0..4 {
            start = monthly.period_end(anchor, start, 1);
            ends.push(start);
        }
        assert_eq!(
            ends,
            vec![date(2025, 2, 28), date(2025, 3, 31), date(2025, 4, 30), date(2025, 5, 31)]
        );

        let quarterly_anchor = date(2025, 11, 30);
        let first = BillingInterval::Quarterly.period_end(quarterly_anchor, quarterly_anchor, 1);
        assert_eq!(first, date(2026, 2, 28));
        assert_eq!(
            BillingInterval::Quarterly.period_end(quarterly_anchor, first, 1),
            date(2026, 5, 30)
        );
        assert_eq!(
            BillingInterval::Monthly.period_end(anchor, date(2025, 2, 28), 2),
            date(2025, 3, 31)
        );
    }

    #[test]
    fn test_day_based_periods_ignore_anchor() {
        let anchor = date(2025, 1, 31);
        assert_eq!(
            BillingInterval::Weekly.period_end(anchor, date(2025, 2, 7), 1),
            date(2025, 2, 14)
        );
        assert_eq!(
            BillingInterval::Daily.period_end(anchor, date(2025, 2, 28), 1),
            date(2025, 3, 1)
        );
    }

    #[test]
    fn test_monthly_factor() {
        assert_eq!(
            (Decimal::from(120) * BillingInterval::Annually.monthly_factor()).round_dp(2),
            Decimal::from(10)
        );
        assert_eq!(
            (Decimal::from(30) * BillingInterval::Quarterly.monthly_factor()).round_dp(2),
            Decimal::from(10)
        );
        // 12 a day is 4380 a year, or 365 a month
        assert_eq!(
            (Decimal::from(12) * BillingInterval::Daily.monthly_factor()).round_dp(2),
            Decimal::from(365)
        );
    }

    #[test]
    fn test_interval_parse_is_strict() {
        assert_eq!(BillingInterval::parse("weekly"), Some(BillingInterval::Weekly));
        assert_eq!(BillingInterval::parse("fortnightly"), None);
    }
}
