//! Process filter
//!
//! Decides whether an observed call is logged, from an ordered filter list and
//! a whitelist/blacklist mode. The first active entry matching the process
//! decides; pid entries match exactly, name entries match as a substring of
//! the process display name.

use std::fmt;

use crate::domain::{EngineError, FilterMode, Pid, Verdict};
use crate::host::ProcessIdentity;

/// Longest name a filter entry stores, in bytes
pub const MAX_FILTER_NAME_LEN: usize = 255;

/// One filter list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterEntry {
    /// Substring of the display name; empty for pid entries
    pub name: String,
    /// Exact pid; `0` for name entries
    pub pid: i32,
    pub active: bool,
}

impl FilterEntry {
    /// Name filter, truncated to [`MAX_FILTER_NAME_LEN`] bytes on a char boundary
    #[must_use]
    pub fn name(name: &str) -> Self {
        let mut end = name.len().min(MAX_FILTER_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self { name: name[..end].to_string(), pid: 0, active: true }
    }

    #[must_use]
    pub fn pid(pid: Pid) -> Self {
        Self { name: String::new(), pid: pid.0, active: true }
    }

    /// Whether this entry selects `identity`
    #[must_use]
    pub fn matches(&self, identity: &ProcessIdentity) -> bool {
        if !self.active {
            return false;
        }
        if self.pid > 0 && self.pid == identity.pid.0 {
            return true;
        }
        !self.name.is_empty() && identity.display_name().contains(self.name.as_str())
    }
}

impl fmt::Display for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pid > 0 {
            write!(f, "pid:{}", self.pid)
        } else {
            write!(f, "name:{}", self.name)
        }
    }
}

/// Ordered, fixed-capacity filter list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterList {
    entries: Vec<FilterEntry>,
}

impl FilterList {
    pub const CAPACITY: usize = 16;

    /// Append an entry, returning its index
    ///
    /// # Errors
    /// `ResourceExhausted` when the list already holds [`Self::CAPACITY`] entries
    pub fn push(&mut self, entry: FilterEntry) -> Result<usize, EngineError> {
        if self.entries.len() >= Self::CAPACITY {
            return Err(EngineError::ResourceExhausted("Maximum filters reached".to_string()));
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }
}

/// Observe or skip a process
///
/// An empty list observes everything regardless of mode.
#[must_use]
pub fn decide(mode: FilterMode, filters: &[FilterEntry], identity: &ProcessIdentity) -> Verdict {
    if filters.is_empty() {
        return Verdict::Observe;
    }

    // The first active entry matching the process decides
    let decider = filters.iter().find(|entry| entry.matches(identity));

    match (mode, decider.is_some()) {
        (FilterMode::Whitelist, true) | (FilterMode::Blacklist, false) => Verdict::Observe,
        (FilterMode::Whitelist, false) | (FilterMode::Blacklist, true) => Verdict::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(pid: i32, name: &str) -> ProcessIdentity {
        ProcessIdentity { pid: Pid(pid), cmdline: Some(name.to_string()), comm: None }
    }

    #[test]
    fn test_empty_list_observes_in_both_modes() {
        let who = identity(7, "anything");
        assert_eq!(decide(FilterMode::Whitelist, &[], &who), Verdict::Observe);
        assert_eq!(decide(FilterMode::Blacklist, &[], &who), Verdict::Observe);
    }

    #[test]
    fn test_first_match_precedence() {
        let filters = [FilterEntry::pid(Pid(5)), FilterEntry::name("x")];

        // pid 5 is caught by the pid rule, name "x" by the name rule
        assert_eq!(decide(FilterMode::Blacklist, &filters, &identity(5, "other")), Verdict::Skip);
        assert_eq!(decide(FilterMode::Blacklist, &filters, &identity(9, "x")), Verdict::Skip);
        assert_eq!(decide(FilterMode::Blacklist, &filters, &identity(9, "y")), Verdict::Observe);

        assert_eq!(decide(FilterMode::Whitelist, &filters, &identity(5, "other")), Verdict::Observe);
        assert_eq!(decide(FilterMode::Whitelist, &filters, &identity(9, "y")), Verdict::Skip);
    }

    #[test]
    fn test_inactive_entry_never_decides() {
        let mut disabled = FilterEntry::pid(Pid(5));
        disabled.active = false;
        let filters = [disabled, FilterEntry::name("app")];

        assert_eq!(decide(FilterMode::Whitelist, &filters, &identity(5, "other")), Verdict::Skip);
        assert_eq!(decide(FilterMode::Whitelist, &filters, &identity(5, "app")), Verdict::Observe);
        assert_eq!(decide(FilterMode::Blacklist, &filters, &identity(5, "other")), Verdict::Observe);
    }

    #[test]
    fn test_name_is_substring_match() {
        let filters = [FilterEntry::name("chrome")];
        let who = identity(100, "com.android.chrome:sandboxed_process0");
        assert_eq!(decide(FilterMode::Whitelist, &filters, &who), Verdict::Observe);
    }

    #[test]
    fn test_inactive_and_empty_entries_never_match() {
        let mut inactive = FilterEntry::pid(Pid(5));
        inactive.active = false;
        let empty_name = FilterEntry { name: String::new(), pid: 0, active: true };
        let filters = [inactive, empty_name];

        assert_eq!(decide(FilterMode::Whitelist, &filters, &identity(5, "app")), Verdict::Skip);
        assert_eq!(decide(FilterMode::Blacklist, &filters, &identity(5, "app")), Verdict::Observe);
    }

    #[test]
    fn test_falls_back_to_comm() {
        let filters = [FilterEntry::name("kworker")];
        let who = ProcessIdentity { pid: Pid(3), cmdline: None, comm: Some("kworker/0:1".to_string()) };
        assert_eq!(decide(FilterMode::Whitelist, &filters, &who), Verdict::Observe);
    }

    #[test]
    fn test_decide_is_deterministic() {
        let filters = [FilterEntry::name("app")];
        let who = identity(1, "my-app");
        let first = decide(FilterMode::Blacklist, &filters, &who);
        for _ in 0..10 {
            assert_eq!(decide(FilterMode::Blacklist, &filters, &who), first);
        }
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        let long = "é".repeat(200);
        let entry = FilterEntry::name(&long);
        assert!(entry.name.len() <= MAX_FILTER_NAME_LEN);
        assert_eq!(entry.name.len(), 254);
    }

    #[test]
    fn test_capacity() {
        let mut list = FilterList::default();
        for i in 0..FilterList::CAPACITY {
            assert_eq!(list.push(FilterEntry::pid(Pid(i as i32 + 1))).unwrap(), i);
        }
        assert!(matches!(
            list.push(FilterEntry::name("one-too-many")),
            Err(EngineError::ResourceExhausted(_))
        ));
        assert_eq!(list.len(), FilterList::CAPACITY);
    }
}
