use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

/// Token amount in the smallest indivisible unit.
///
/// Signed so that ledger entries can carry debits as negative values; vault
/// balances built from it are kept non-negative by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn new(units: i64) -> Self {
        Amount(units)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Amount(self.0.abs())
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// `floor(self * bps / 10_000)`, computed in 128 bits so it cannot overflow.
    pub fn floor_bps(self, bps: u32) -> Self {
        let scaled = (self.0 as i128 * bps as i128).div_euclid(10_000);
        Amount(scaled as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount(-self.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl From<i64> for Amount {
    fn from(units: i64) -> Self {
        Amount(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_plain_integer() {
        assert_eq!(Amount::new(1_000).to_string(), "1000");
        assert_eq!(Amount::new(-65).to_string(), "-65");
        assert_eq!(Amount::ZERO.to_string(), "0");
    }

    #[test]
    fn default_is_zero() {
        assert_eq!(Amount::default(), Amount::ZERO);
    }

    #[test]
    fn floor_bps_rounds_down() {
        assert_eq!(Amount::new(100).floor_bps(3500), Amount::new(35));
        assert_eq!(Amount::new(101).floor_bps(3500), Amount::new(35));
        assert_eq!(Amount::new(3).floor_bps(3500), Amount::new(1));
        assert_eq!(Amount::new(1).floor_bps(3500), Amount::ZERO);
        assert_eq!(Amount::new(i64::MAX).floor_bps(10_000), Amount::new(i64::MAX));
    }

    #[test]
    fn checked_ops_detect_overflow() {
        assert_eq!(Amount::new(i64::MAX).checked_add(Amount::new(1)), None);
        assert_eq!(Amount::new(i64::MIN).checked_sub(Amount::new(1)), None);
        assert_eq!(
            Amount::new(10).checked_sub(Amount::new(4)),
            Some(Amount::new(6))
        );
    }

    #[test]
    fn add_sub_assign() {
        let mut a = Amount::new(100);
        a += Amount::new(50);
        a -= Amount::new(30);
        assert_eq!(a, Amount::new(120));
        assert_eq!(-a, Amount::new(-120));
    }

    #[test]
    fn sum_of_amounts() {
        let total: Amount = [10, -3, 5].into_iter().map(Amount::new).sum();
        assert_eq!(total, Amount::new(12));
    }

    #[test]
    fn ordering() {
        assert!(Amount::new(-1) < Amount::ZERO);
        assert!(Amount::ZERO < Amount::new(1));
        assert!(Amount::new(1).is_positive());
        assert!(Amount::new(-1).is_negative());
    }
}
