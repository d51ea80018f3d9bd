//! Core domain types for the treasury ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Amount;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of an end user (payer, creator, or both).
    UserId
);
string_id!(
    /// Identifier of a vault row.
    VaultId
);
string_id!(
    /// Ledger entry identifier, derived from the idempotency key of the
    /// operation that wrote it.
    EntryId
);
string_id!(
    /// Identifier shared by all entries of one logical transaction. For
    /// spends this is the caller's idempotency key.
    TransactionId
);
string_id!(RefundId);
string_id!(PayoutRequestId);
string_id!(
    /// Opaque reference to a creator's registered payout destination.
    PayoutMethodId
);

const USER_PREFIX: &str = "user:";
const CREATOR_PREFIX: &str = "creator:";
const PLATFORM_REVENUE: &str = "platform:revenue";
const TREASURY_HOT: &str = "treasury:hot";
const TREASURY_COLD: &str = "treasury:cold";

impl VaultId {
    /// Spendable wallet of a user.
    pub fn user(owner: &UserId) -> Self {
        Self(format!("{USER_PREFIX}{owner}"))
    }

    /// Earnings vault of a creator.
    pub fn creator(owner: &UserId) -> Self {
        Self(format!("{CREATOR_PREFIX}{owner}"))
    }

    pub fn platform_revenue() -> Self {
        Self(PLATFORM_REVENUE.to_string())
    }

    pub fn hot() -> Self {
        Self(TREASURY_HOT.to_string())
    }

    pub fn cold() -> Self {
        Self(TREASURY_COLD.to_string())
    }

    /// Kind and owner encoded in the id, `None` for ids not minted by this crate.
    pub fn describe(&self) -> Option<(VaultKind, Option<UserId>)> {
        if let Some(owner) = self.0.strip_prefix(USER_PREFIX) {
            return Some((VaultKind::User, Some(UserId::new(owner))));
        }
        if let Some(owner) = self.0.strip_prefix(CREATOR_PREFIX) {
            return Some((VaultKind::Creator, Some(UserId::new(owner))));
        }
        match self.0.as_str() {
            PLATFORM_REVENUE => Some((VaultKind::PlatformRevenue, None)),
            TREASURY_HOT => Some((VaultKind::Hot, None)),
            TREASURY_COLD => Some((VaultKind::Cold, None)),
            _ => None,
        }
    }
}

impl PayoutRequestId {
    /// Request id for a creator's payout idempotency key.
    pub fn derive(creator: &UserId, key: &str) -> Self {
        Self(format!("payout:{creator}:{key}"))
    }
}

/// Error returned when parsing one of the closed string enums.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what} '{value}'")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

macro_rules! closed_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError { what: $what, value: other.to_string() }),
                }
            }
        }
    };
}

closed_enum!(
    /// Kind of a vault row.
    VaultKind, "vault kind" {
        User => "USER",
        Creator => "CREATOR",
        PlatformRevenue => "PLATFORM_REVENUE",
        Hot => "HOT",
        Cold => "COLD",
    }
);

impl VaultKind {
    /// Hot and cold vaults hold the reserve backing every liability vault.
    pub fn is_reserve(self) -> bool {
        matches!(self, VaultKind::Hot | VaultKind::Cold)
    }
}

closed_enum!(
    /// Kind of value movement recorded by a ledger entry.
    EntryKind, "entry kind" {
        Purchase => "PURCHASE",
        Spend => "SPEND",
        Earn => "EARN",
        Commission => "COMMISSION",
        Refund => "REFUND",
        Payout => "PAYOUT",
        Rebalance => "REBALANCE",
    }
);

closed_enum!(
    /// What a spend paid for.
    SpendKind, "spend kind" {
        Chat => "CHAT",
        Call => "CALL",
        Event => "EVENT",
        Gift => "GIFT",
        Content => "CONTENT",
        Boost => "BOOST",
    }
);

closed_enum!(
    RefundStatus, "refund status" {
        Requested => "REQUESTED",
        Eligible => "ELIGIBLE",
        Denied => "DENIED",
        Reversed => "REVERSED",
    }
);

closed_enum!(
    PayoutStatus, "payout status" {
        Requested => "REQUESTED",
        Locked => "LOCKED",
        Approved => "APPROVED",
        Released => "RELEASED",
        Rejected => "REJECTED",
    }
);

closed_enum!(
    /// Safety check that blocked a payout.
    PayoutBlockReason, "payout block reason" {
        Kyc => "KYC",
        Risk => "RISK",
        Region => "REGION",
        Balance => "BALANCE",
    }
);

impl PayoutStatus {
    /// Funds of a payout in this state are still counted in the vault's `locked`.
    pub fn holds_reservation(self) -> bool {
        matches!(self, PayoutStatus::Requested | PayoutStatus::Locked)
    }

    pub fn can_transition_to(self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;
        matches!(
            (self, next),
            (Requested, Locked)
                | (Requested, Rejected)
                | (Locked, Approved)
                | (Locked, Rejected)
                | (Approved, Released)
        )
    }
}

/// A named balance bucket.
///
/// Balances only change through a [`Changeset`](crate::store::Changeset) that
/// also appends the ledger entries backing the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub kind: VaultKind,
    pub owner: Option<UserId>,
    pub available: Amount,
    pub locked: Amount,
    pub lifetime_in: Amount,
    pub lifetime_out: Amount,
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, 0 for a vault that has never been written.
    pub version: u64,
}

impl Vault {
    /// Empty vault for `id`. Ids not minted by [`VaultId`] constructors are treated as user wallets.
    pub fn empty(id: VaultId) -> Self {
        let (kind, owner) = id.describe().unwrap_or((VaultKind::User, None));
        Self {
            id,
            kind,
            owner,
            available: Amount::ZERO,
            locked: Amount::ZERO,
            lifetime_in: Amount::ZERO,
            lifetime_out: Amount::ZERO,
            updated_at: None,
            version: 0,
        }
    }

    pub fn total(&self) -> Amount {
        self.available + self.locked
    }

    pub fn balance(&self) -> VaultBalance {
        VaultBalance {
            available: self.available,
            locked: self.locked,
            lifetime_in: self.lifetime_in,
            lifetime_out: self.lifetime_out,
        }
    }
}

/// Externally visible balance of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VaultBalance {
    pub available: Amount,
    pub locked: Amount,
    pub lifetime_in: Amount,
    pub lifetime_out: Amount,
}

/// Immutable record of one signed value movement on one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Position in the ledger, assigned by the store at commit (starts at 1).
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub vault: VaultId,
    pub counterparty: Option<VaultId>,
    pub amount: Amount,
    pub related_transaction: TransactionId,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LedgerEntry {
    pub fn new(
        id: EntryId,
        timestamp: DateTime<Utc>,
        kind: EntryKind,
        vault: VaultId,
        amount: Amount,
        related_transaction: TransactionId,
    ) -> Self {
        Self {
            id,
            sequence: 0,
            timestamp,
            kind,
            vault,
            counterparty: None,
            amount,
            related_transaction,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_counterparty(mut self, counterparty: VaultId) -> Self {
        self.counterparty = Some(counterparty);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Fixed platform commission, in basis points of the gross amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    platform_rate_bps: u32,
}

impl SplitPolicy {
    pub const MAX_BPS: u32 = 10_000;

    pub fn new(platform_rate_bps: u32) -> Option<Self> {
        (platform_rate_bps <= Self::MAX_BPS).then_some(Self { platform_rate_bps })
    }

    pub fn platform_rate_bps(&self) -> u32 {
        self.platform_rate_bps
    }

    /// Returns `(earner_share, platform_share)`.
    ///
    /// The platform share is floored; the earner receives the remainder so the
    /// two always add up to `gross`.
    pub fn split(&self, gross: Amount) -> (Amount, Amount) {
        let platform = gross.floor_bps(self.platform_rate_bps);
        (gross - platform, platform)
    }
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            platform_rate_bps: 3_500,
        }
    }
}

/// Record of one allocated spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendTransaction {
    pub id: TransactionId,
    pub kind: SpendKind,
    pub payer: UserId,
    pub earner: Option<UserId>,
    pub payer_vault: VaultId,
    pub earner_vault: Option<VaultId>,
    pub platform_vault: VaultId,
    pub gross_amount: Amount,
    pub earner_share: Amount,
    pub platform_share: Amount,
    pub created_at: DateTime<Utc>,
}

impl SpendTransaction {
    /// Build a spend, splitting `gross` with `policy`. Without an earner the
    /// platform receives the whole gross amount.
    pub fn new(
        id: TransactionId,
        kind: SpendKind,
        payer: UserId,
        earner: Option<UserId>,
        gross: Amount,
        policy: &SplitPolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (earner_share, platform_share) = match earner {
            Some(_) => policy.split(gross),
            None => (Amount::ZERO, gross),
        };
        Self {
            id,
            kind,
            payer_vault: VaultId::user(&payer),
            earner_vault: earner.as_ref().map(VaultId::creator),
            payer,
            earner,
            platform_vault: VaultId::platform_revenue(),
            gross_amount: gross,
            earner_share,
            platform_share,
            created_at,
        }
    }
}

/// Who asked for or decided something.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "lowercase")]
pub enum Actor {
    User(UserId),
    Admin(String),
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::Admin(id) => write!(f, "admin:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

impl FromStr for Actor {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", id)) => Ok(Actor::User(UserId::new(id))),
            Some(("admin", id)) => Ok(Actor::Admin(id.to_string())),
            None if s == "system" => Ok(Actor::System),
            _ => Err(ParseEnumError {
                what: "actor",
                value: s.to_string(),
            }),
        }
    }
}

/// Decision on a refund request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: RefundId,
    pub original_transaction: TransactionId,
    pub requested_by: Actor,
    pub status: RefundStatus,
    pub refunded_amount: Amount,
    pub reason: String,
    /// Denial reason, set when `status` is `Denied`.
    pub denial: Option<String>,
    pub decided_by: Option<Actor>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl RefundStatus {
    /// REQUESTED and ELIGIBLE are in-flight states; only DENIED and REVERSED
    /// records are persisted.
    pub fn can_transition_to(self, next: RefundStatus) -> bool {
        use RefundStatus::*;
        matches!(
            (self, next),
            (Requested, Eligible) | (Requested, Denied) | (Eligible, Reversed)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, RefundStatus::Denied | RefundStatus::Reversed)
    }
}

impl RefundRecord {
    /// A refund request before any eligibility decision.
    pub fn requested(
        transaction: &TransactionId,
        requested_by: &Actor,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RefundId::new(format!("refund:{}", Uuid::now_v7())),
            original_transaction: transaction.clone(),
            requested_by: requested_by.clone(),
            status: RefundStatus::Requested,
            refunded_amount: Amount::ZERO,
            reason: reason.to_string(),
            denial: None,
            decided_by: None,
            created_at: now,
            decided_at: None,
        }
    }

    pub fn eligible(self) -> Self {
        self.advance(RefundStatus::Eligible)
    }

    /// Reversals are keyed by their transaction, so at most one can be stored.
    pub fn reversed(mut self, amount: Amount, now: DateTime<Utc>) -> Self {
        self.id = RefundId::new(format!("refund:{}", self.original_transaction));
        self.refunded_amount = amount;
        self.decided_by = Some(self.requested_by.clone());
        self.decided_at = Some(now);
        self.advance(RefundStatus::Reversed)
    }

    pub fn denied(mut self, code: &str, now: DateTime<Utc>) -> Self {
        self.denial = Some(code.to_string());
        self.decided_by = Some(Actor::System);
        self.decided_at = Some(now);
        self.advance(RefundStatus::Denied)
    }

    fn advance(mut self, next: RefundStatus) -> Self {
        debug_assert!(
            self.status.can_transition_to(next),
            "refund {} -> {next}",
            self.status
        );
        self.status = next;
        self
    }
}

/// Outcome of an individual payout safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl CheckOutcome {
    pub fn from_bool(passed: bool) -> Self {
        if passed {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyChecks {
    pub kyc: CheckOutcome,
    pub risk: CheckOutcome,
    pub region: CheckOutcome,
    pub balance: CheckOutcome,
}

impl SafetyChecks {
    /// First failed check, in KYC, risk, region, balance order.
    pub fn first_failure(&self) -> Option<PayoutBlockReason> {
        [
            (self.kyc, PayoutBlockReason::Kyc),
            (self.risk, PayoutBlockReason::Risk),
            (self.region, PayoutBlockReason::Region),
            (self.balance, PayoutBlockReason::Balance),
        ]
        .into_iter()
        .find(|(outcome, _)| *outcome == CheckOutcome::Failed)
        .map(|(_, reason)| reason)
    }
}

/// A creator's withdrawal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: PayoutRequestId,
    pub creator: UserId,
    pub creator_vault: VaultId,
    pub method: PayoutMethodId,
    pub amount: Amount,
    pub status: PayoutStatus,
    pub checks: SafetyChecks,
    pub risk_score: Option<f64>,
    pub decided_by: Option<Actor>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Inputs of the ledger, as replayed by the CLI and [`Treasury::apply`](crate::Treasury::apply).
#[derive(Debug, Clone)]
pub enum Command {
    /// Credit tokens bought through the external payment processor.
    Purchase {
        user: UserId,
        reference: String,
        amount: Amount,
    },
    /// Pay an earner (or the platform alone) from a user wallet.
    Spend {
        payer: UserId,
        earner: Option<UserId>,
        amount: Amount,
        kind: SpendKind,
        key: TransactionId,
    },
    /// Ask for a spend to be reversed.
    Refund {
        transaction: TransactionId,
        requested_by: Actor,
        reason: String,
        /// Administrator override of the grace window.
        override_window: bool,
    },
    /// Lock creator funds for withdrawal.
    Payout {
        creator: UserId,
        amount: Amount,
        method: PayoutMethodId,
        key: String,
    },
    /// Administrative decision on a locked payout.
    DecidePayout {
        request: PayoutRequestId,
        approve: bool,
        decided_by: Actor,
    },
    /// External rail confirmed an approved payout.
    ConfirmReleased { request: PayoutRequestId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_id_round_trips_kind_and_owner() {
        let alice = UserId::new("alice");
        assert_eq!(
            VaultId::user(&alice).describe(),
            Some((VaultKind::User, Some(alice.clone())))
        );
        assert_eq!(
            VaultId::creator(&alice).describe(),
            Some((VaultKind::Creator, Some(alice)))
        );
        assert_eq!(
            VaultId::hot().describe(),
            Some((VaultKind::Hot, None))
        );
        assert_eq!(VaultId::new("elsewhere").describe(), None);
    }

    #[test]
    fn split_is_exact_and_floors_platform() {
        let policy = SplitPolicy::default();
        assert_eq!(policy.split(Amount::new(100)), (Amount::new(65), Amount::new(35)));
        // 35% of 7 is 2.45, floored to 2
        assert_eq!(policy.split(Amount::new(7)), (Amount::new(5), Amount::new(2)));
        assert_eq!(policy.split(Amount::new(1)), (Amount::new(1), Amount::ZERO));
    }

    #[test]
    fn split_policy_rejects_rates_above_full() {
        assert!(SplitPolicy::new(10_001).is_none());
        assert!(SplitPolicy::new(10_000).is_some());
    }

    #[test]
    fn spend_without_earner_goes_to_platform() {
        let spend = SpendTransaction::new(
            TransactionId::new("boost-1"),
            SpendKind::Boost,
            UserId::new("alice"),
            None,
            Amount::new(40),
            &SplitPolicy::default(),
            Utc::now(),
        );
        assert_eq!(spend.earner_share, Amount::ZERO);
        assert_eq!(spend.platform_share, Amount::new(40));
        assert_eq!(spend.earner_vault, None);
    }

    #[test]
    fn payout_state_machine() {
        use PayoutStatus::*;
        assert!(Requested.can_transition_to(Locked));
        assert!(Requested.can_transition_to(Rejected));
        assert!(Locked.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Released));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Locked));
        assert!(!Released.can_transition_to(Approved));
        assert!(Locked.holds_reservation());
        assert!(!Approved.holds_reservation());
    }

    #[test]
    fn refund_lifecycle() {
        let now = Utc::now();
        let tx = TransactionId::new("chat-1");
        let alice = Actor::User(UserId::new("alice"));

        let request = RefundRecord::requested(&tx, &alice, "", now);
        assert_eq!(request.status, RefundStatus::Requested);
        assert!(!request.status.is_final());

        let reversed = request.clone().eligible().reversed(Amount::new(65), now);
        assert_eq!(reversed.status, RefundStatus::Reversed);
        assert_eq!(reversed.id, RefundId::new("refund:chat-1"));
        assert_eq!(reversed.decided_by, Some(alice));
        assert!(reversed.status.is_final());

        let denied = request.denied("GRACE_WINDOW_EXPIRED", now);
        assert_eq!(denied.status, RefundStatus::Denied);
        assert_ne!(denied.id, reversed.id);
        assert_eq!(denied.refunded_amount, Amount::ZERO);
        assert_eq!(denied.decided_by, Some(Actor::System));

        assert!(!RefundStatus::Eligible.can_transition_to(RefundStatus::Requested));
        assert!(!RefundStatus::Reversed.can_transition_to(RefundStatus::Denied));
    }

    #[test]
    fn closed_enums_parse_their_display() {
        for kind in EntryKind::ALL {
            assert_eq!(kind.as_str().parse::<EntryKind>(), Ok(*kind));
        }
        assert!("TRANSFER".parse::<EntryKind>().is_err());
    }

    #[test]
    fn actor_parses_and_displays() {
        let admin: Actor = "admin:ops".parse().unwrap();
        assert_eq!(admin, Actor::Admin("ops".into()));
        assert_eq!(admin.to_string(), "admin:ops");
        assert_eq!("system".parse::<Actor>(), Ok(Actor::System));
        assert!("root".parse::<Actor>().is_err());
    }

    #[test]
    fn first_failure_follows_check_order() {
        let checks = SafetyChecks {
            kyc: CheckOutcome::Passed,
            risk: CheckOutcome::Failed,
            region: CheckOutcome::Failed,
            balance: CheckOutcome::Passed,
        };
        assert_eq!(checks.first_failure(), Some(PayoutBlockReason::Risk));
        assert_eq!(SafetyChecks::default().first_failure(), None);
    }
}
