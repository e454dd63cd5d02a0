//! Tab History Tracker
//!
//! Per-tab navigation state used to compute the "true referrer" of a visit.
//! Browser events arrive out of order: a tab is often created as
//! `about:blank` with its real URL following later, and opener information
//! can show up only on the first update. The tracker absorbs all of that and
//! answers one question: where did this tab's current page come from.
//!
//! Ownership: the intake handlers are the only mutators. The workflow and
//! the orphan retry scan read through [`TabTracker::snapshot`], which clones;
//! no reader ever holds a reference into the internal map.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// TAB HISTORY
// ============================================================================

/// Ordered URL chain for one tab.
///
/// `previous_url` only advances when the new URL actually differs from
/// `current_url`, so repeated identical navigations never shift the
/// referrer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabHistory {
    pub current_url: String,
    pub current_at: DateTime<Utc>,
    pub previous_url: Option<String>,
    pub previous_at: Option<DateTime<Utc>>,
    pub opener_tab_id: Option<i64>,
}

impl TabHistory {
    fn new(url: String, opener_tab_id: Option<i64>) -> Self {
        Self {
            current_url: url,
            current_at: Utc::now(),
            previous_url: None,
            previous_at: None,
            opener_tab_id,
        }
    }

    /// Advance to a new URL, promoting the prior current URL.
    fn advance(&mut self, new_url: String) {
        self.previous_url = Some(std::mem::replace(&mut self.current_url, new_url));
        self.previous_at = Some(self.current_at);
        self.current_at = Utc::now();
    }

    fn has_usable_previous(&self) -> bool {
        match self.previous_url.as_deref() {
            None | Some("") | Some("about:blank") => false,
            Some(_) => true,
        }
    }
}

// ============================================================================
// TRACKER
// ============================================================================

/// Referrer resolved for a tab: the URL and the moment it was current.
pub type Referrer = (String, DateTime<Utc>);

/// Tracks [`TabHistory`] per open browser tab.
#[derive(Debug, Default)]
pub struct TabTracker {
    tabs: HashMap<i64, TabHistory>,
}

impl TabTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tab was created. If the opener is already known and has a current
    /// URL, that URL becomes this tab's previous_url immediately.
    pub fn on_tab_created(&mut self, tab_id: i64, url: Option<String>, opener_tab_id: Option<i64>) {
        let mut history = TabHistory::new(
            url.unwrap_or_else(|| "about:blank".to_string()),
            opener_tab_id,
        );

        if let Some(opener) = opener_tab_id {
            match self.tabs.get(&opener) {
                Some(opener_history) => {
                    history.previous_url = Some(opener_history.current_url.clone());
                    history.previous_at = Some(opener_history.current_at);
                }
                None => {
                    debug!(tab_id, opener, "Opener tab unknown at creation");
                }
            }
        }

        self.tabs.insert(tab_id, history);
    }

    /// A tab changed. Late-arriving opener information triggers the same
    /// reparenting as at creation; a URL change advances the chain only when
    /// the URL actually differs.
    pub fn on_tab_updated(
        &mut self,
        tab_id: i64,
        new_url: Option<String>,
        opener_tab_id: Option<i64>,
    ) {
        // Resolve the opener's current state before borrowing this tab.
        let opener_state = opener_tab_id
            .and_then(|opener| self.tabs.get(&opener))
            .map(|h| (h.current_url.clone(), h.current_at));

        let history = match self.tabs.get_mut(&tab_id) {
            Some(h) => h,
            None => {
                // Update for a tab we never saw created; treat as creation.
                self.on_tab_created(tab_id, new_url, opener_tab_id);
                return;
            }
        };

        if let Some(opener) = opener_tab_id {
            if history.opener_tab_id.is_none() {
                history.opener_tab_id = Some(opener);
                if !history.has_usable_previous() {
                    if let Some((url, at)) = opener_state {
                        history.previous_url = Some(url);
                        history.previous_at = Some(at);
                    } else {
                        debug!(tab_id, opener, "Opener tab unknown at update");
                    }
                }
            }
        }

        if let Some(new_url) = new_url {
            if new_url != history.current_url {
                history.advance(new_url);
            }
        }
    }

    /// The tab is gone; drop its history.
    pub fn on_tab_removed(&mut self, tab_id: i64) {
        self.tabs.remove(&tab_id);
    }

    /// Client-side navigation that did not trigger a full load. Treated as a
    /// URL change; the prior current URL is always promoted.
    pub fn on_in_page_navigation(&mut self, tab_id: i64, new_url: String) {
        self.on_tab_updated(tab_id, Some(new_url), None);
    }

    /// Resolve the referrer for a tab.
    ///
    /// Prefers the tab's own previous URL; when that is empty or
    /// `about:blank` and an opener is known, falls back to the opener's
    /// current URL. Opener lookup is one hop, matching how browsers report
    /// `opener_tab_id`.
    pub fn get_referrer(&self, tab_id: i64) -> Option<Referrer> {
        let history = self.tabs.get(&tab_id)?;

        if history.has_usable_previous() {
            let url = history.previous_url.clone()?;
            let at = history.previous_at?;
            return Some((url, at));
        }

        let opener = history.opener_tab_id?;
        match self.tabs.get(&opener) {
            Some(opener_history) => Some((
                opener_history.current_url.clone(),
                opener_history.current_at,
            )),
            None => {
                debug!(tab_id, opener, "Opener tab missing; treating as no referrer");
                None
            }
        }
    }

    /// Current URL and timestamp of a tab, if known.
    pub fn current_of(&self, tab_id: i64) -> Option<Referrer> {
        self.tabs
            .get(&tab_id)
            .map(|h| (h.current_url.clone(), h.current_at))
    }

    /// Cloned view of one tab's history.
    pub fn snapshot(&self, tab_id: i64) -> Option<TabHistory> {
        self.tabs.get(&tab_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_change_promotes_previous() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://a.example.com".into()), None);
        tracker.on_tab_updated(1, Some("https://b.example.com".into()), None);

        let (url, _) = tracker.get_referrer(1).unwrap();
        assert_eq!(url, "https://a.example.com");

        let history = tracker.snapshot(1).unwrap();
        assert_eq!(history.current_url, "https://b.example.com");
    }

    #[test]
    fn test_identical_navigation_does_not_shift_referrer() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://a.example.com".into()), None);
        tracker.on_tab_updated(1, Some("https://b.example.com".into()), None);
        // Reload of the same URL
        tracker.on_tab_updated(1, Some("https://b.example.com".into()), None);

        let (url, _) = tracker.get_referrer(1).unwrap();
        assert_eq!(url, "https://a.example.com");
    }

    #[test]
    fn test_opener_known_at_creation() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://parent.example.com".into()), None);
        tracker.on_tab_created(2, None, Some(1));

        // New tab starts at about:blank but inherits the opener's URL
        let (url, _) = tracker.get_referrer(2).unwrap();
        assert_eq!(url, "https://parent.example.com");
    }

    #[test]
    fn test_opener_arriving_late() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://parent.example.com".into()), None);
        tracker.on_tab_created(2, None, None);
        tracker.on_tab_updated(2, Some("https://child.example.com".into()), Some(1));

        let history = tracker.snapshot(2).unwrap();
        assert_eq!(history.opener_tab_id, Some(1));
        // previous was about:blank -> replaced by the navigation; the
        // referrer falls back through the recorded chain
        let (url, _) = tracker.get_referrer(2).unwrap();
        assert_eq!(url, "https://parent.example.com");
    }

    #[test]
    fn test_about_blank_previous_falls_back_to_opener() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://parent.example.com".into()), None);
        tracker.on_tab_created(2, Some("about:blank".into()), Some(1));
        tracker.on_tab_updated(2, Some("https://child.example.com".into()), None);

        // The resolved referrer is the opener's page, not about:blank
        let (url, _) = tracker.get_referrer(2).unwrap();
        assert_eq!(url, "https://parent.example.com");
    }

    #[test]
    fn test_missing_opener_is_no_referrer() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(2, Some("https://child.example.com".into()), Some(99));
        assert!(tracker.get_referrer(2).is_none());
    }

    #[test]
    fn test_in_page_navigation_advances() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://app.example.com/".into()), None);
        tracker.on_in_page_navigation(1, "https://app.example.com/settings".into());

        let (url, _) = tracker.get_referrer(1).unwrap();
        assert_eq!(url, "https://app.example.com/");
    }

    #[test]
    fn test_tab_removed() {
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://a.example.com".into()), None);
        assert_eq!(tracker.len(), 1);
        tracker.on_tab_removed(1);
        assert!(tracker.is_empty());
        assert!(tracker.get_referrer(1).is_none());
    }

    #[test]
    fn test_referrer_monotonicity() {
        // previous_url at any point is a URL that was current_url earlier
        let mut tracker = TabTracker::new();
        tracker.on_tab_created(1, Some("https://one.example.com".into()), None);
        let mut seen_current = vec!["https://one.example.com".to_string()];

        for next in ["https://two.example.com", "https://three.example.com"] {
            tracker.on_tab_updated(1, Some(next.into()), None);
            let (referrer, _) = tracker.get_referrer(1).unwrap();
            assert!(seen_current.contains(&referrer));
            seen_current.push(next.to_string());
        }
    }
}
