use std::collections::BTreeSet;
use std::fmt;

/// One kind of record a task can (re)generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreKeyTarget {
    SignedPreKey,
    OneTimePreKey,
    OneTimePqPreKey,
    LastResortPqPreKey,
}

impl PreKeyTarget {
    pub const ALL: [PreKeyTarget; 4] = [
        PreKeyTarget::SignedPreKey,
        PreKeyTarget::OneTimePreKey,
        PreKeyTarget::OneTimePqPreKey,
        PreKeyTarget::LastResortPqPreKey,
    ];

    /// Whether the kind is a post-quantum (ML-KEM) record.
    pub fn is_pq(self) -> bool {
        matches!(
            self,
            PreKeyTarget::OneTimePqPreKey | PreKeyTarget::LastResortPqPreKey
        )
    }

    /// Whether deciding on this kind needs the server's remaining-key count.
    pub fn needs_remote_count(self) -> bool {
        matches!(
            self,
            PreKeyTarget::OneTimePreKey | PreKeyTarget::OneTimePqPreKey
        )
    }
}

impl fmt::Display for PreKeyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PreKeyTarget::SignedPreKey => "signed",
            PreKeyTarget::OneTimePreKey => "one-time",
            PreKeyTarget::OneTimePqPreKey => "one-time-pq",
            PreKeyTarget::LastResortPqPreKey => "last-resort-pq",
        })
    }
}

/// A set of [`PreKeyTarget`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets(BTreeSet<PreKeyTarget>);

impl Targets {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        PreKeyTarget::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, target: PreKeyTarget) -> bool {
        self.0.insert(target)
    }

    pub fn contains(&self, target: PreKeyTarget) -> bool {
        self.0.contains(&target)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = PreKeyTarget> + '_ {
        self.0.iter().copied()
    }

    /// Drop the post-quantum kinds.
    pub fn without_pq(&self) -> Self {
        self.iter().filter(|t| !t.is_pq()).collect()
    }

    pub fn needs_remote_count(&self) -> bool {
        self.iter().any(PreKeyTarget::needs_remote_count)
    }
}

impl FromIterator<PreKeyTarget> for Targets {
    fn from_iter<I: IntoIterator<Item = PreKeyTarget>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[PreKeyTarget; N]> for Targets {
    fn from(targets: [PreKeyTarget; N]) -> Self {
        targets.into_iter().collect()
    }
}

impl fmt::Display for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, target) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{target}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let mut targets = Targets::empty();
        assert!(targets.is_empty());
        assert!(targets.insert(PreKeyTarget::SignedPreKey));
        assert!(!targets.insert(PreKeyTarget::SignedPreKey));
        assert!(targets.contains(PreKeyTarget::SignedPreKey));
        assert!(!targets.contains(PreKeyTarget::OneTimePreKey));
        assert_eq!(targets.len(), 1);
        assert!(!targets.needs_remote_count());
    }

    #[test]
    fn pq_filtering() {
        let all = Targets::all();
        assert_eq!(all.len(), 4);
        assert!(all.needs_remote_count());

        let classic = all.without_pq();
        assert_eq!(
            classic,
            Targets::from([PreKeyTarget::SignedPreKey, PreKeyTarget::OneTimePreKey])
        );
    }

    #[test]
    fn display() {
        let targets = Targets::from([PreKeyTarget::LastResortPqPreKey, PreKeyTarget::SignedPreKey]);
        assert_eq!(targets.to_string(), "[signed, last-resort-pq]");
        assert_eq!(Targets::empty().to_string(), "[]");
    }
}
