//! Registry: destination groups, subscriptions, and their users, tracked in
//! three maps protected by one lock so they are always observed in a
//! mutually consistent state.
//!
//! Session *handles* are tracked here too, since closing all sessions using
//! a group is one of the Registry's operations — but only the non-blocking
//! half of session lifecycle: [`Registry::close_group_sessions`] and
//! [`Registry::install_session`] never await, so they can run inside the
//! lock. Constructing a *new* session is inherently async (it dials out) and
//! is therefore the Config Reflector's job, composed from the primitives
//! here — see `reflector.rs`.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ConfigError,
    model::{Destination, Subscription},
    session::PublishSession,
};

/// A live session plus the cancellation handle the Reflector created it
/// with. `close()` and `cancel()` are both non-blocking, so holding the
/// Registry's lock across them is safe.
#[derive(Clone)]
pub struct SessionHandle {
    session: std::sync::Arc<PublishSession>,
    cancel: CancellationToken,
}

impl SessionHandle {
    #[must_use]
    pub fn new(session: std::sync::Arc<PublishSession>, cancel: CancellationToken) -> Self {
        Self { session, cancel }
    }

    /// Idempotent: a no-op if the session is already closed.
    pub fn close(&self) {
        self.session.close();
    }

    /// Cancels the session's root-derived context. Distinct from `close` —
    /// closing does not cancel the root context; cancellation is a
    /// separate step taken by the Reflector.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn session(&self) -> std::sync::Arc<PublishSession> {
        self.session.clone()
    }
}

#[derive(Default)]
struct State {
    groups: HashMap<String, Vec<Destination>>,
    subs: HashMap<String, Subscription>,
    /// group name -> subscription names, insertion order preserved.
    users: HashMap<String, Vec<String>>,
    sessions: HashMap<String, SessionHandle>,
}

/// Process-wide registry. Cloning is cheap (it's an `Arc` internally via
/// `Mutex` sharing through `std::sync::Arc<Registry>` at the call site);
/// the type itself holds no `Arc` because every consumer is expected to
/// wrap it in one, the same shape `Arc<ArcSwap<ServiceConfig>>` gives a
/// listener manager sharing config across connections.
#[derive(Default)]
pub struct Registry {
    state: Mutex<State>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites (or creates) a destination group's membership. Does not
    /// touch sessions — callers restart referencing sessions separately.
    pub fn upsert_group(&self, name: &str, destinations: Vec<Destination>) {
        let mut state = self.state.lock();
        state.groups.insert(name.to_owned(), destinations);
        state.users.entry(name.to_owned()).or_default();
    }

    /// Removes a group. Fails with `ConfigError::GroupInUse` — and leaves
    /// `groups`/`subs`/`users` entirely unchanged — if any subscription
    /// still references it.
    pub fn remove_group(&self, name: &str) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        let users = state.users.get(name).cloned().unwrap_or_default();
        if !users.is_empty() {
            return Err(ConfigError::GroupInUse {
                group: name.to_owned(),
                users,
            });
        }
        state.groups.remove(name);
        state.users.remove(name);
        Ok(())
    }

    #[must_use]
    pub fn group_destinations(&self, name: &str) -> Option<Vec<Destination>> {
        self.state.lock().groups.get(name).cloned()
    }

    #[must_use]
    pub fn group_exists(&self, name: &str) -> bool {
        self.state.lock().groups.contains_key(name)
    }

    /// Every known destination group name, used by the Global-row handler
    /// to restart sessions across all groups.
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.state.lock().groups.keys().cloned().collect()
    }

    /// Names of every subscription currently in `users[group]`, in
    /// insertion order.
    #[must_use]
    pub fn group_users(&self, group: &str) -> Vec<String> {
        self.state.lock().users.get(group).cloned().unwrap_or_default()
    }

    /// Registers or replaces a subscription record and (idempotently, in
    /// insertion order) adds its name to `users[dst_group]` if it has one.
    /// If a subscription of the same name previously referenced a
    /// *different* group, it is removed from that group's user list first.
    pub fn upsert_subscription(&self, sub: Subscription) {
        let mut state = self.state.lock();
        let name = sub.name.clone();

        if let Some(previous) = state.subs.get(&name)
            && previous.dst_group != sub.dst_group
            && let Some(old_group) = previous.dst_group.clone()
        {
            Self::remove_user(&mut state.users, &old_group, &name);
        }

        if let Some(group) = sub.dst_group.clone() {
            let users = state.users.entry(group).or_default();
            if !users.iter().any(|u| u == &name) {
                users.push(name.clone());
            }
        }

        state.subs.insert(name, sub);
    }

    /// Removes a subscription, its user-list entry, and any installed
    /// session handle. Returns the handle so the caller can close/cancel it
    /// outside the lock if desired (it's fine to do it inside too, since
    /// both operations are non-blocking).
    pub fn remove_subscription(&self, name: &str) -> Option<SessionHandle> {
        let mut state = self.state.lock();
        if let Some(sub) = state.subs.remove(name)
            && let Some(group) = sub.dst_group
        {
            Self::remove_user(&mut state.users, &group, name);
        }
        state.sessions.remove(name)
    }

    fn remove_user(users: &mut HashMap<String, Vec<String>>, group: &str, name: &str) {
        if let Some(list) = users.get_mut(group) {
            list.retain(|n| n != name);
        }
    }

    #[must_use]
    pub fn subscription(&self, name: &str) -> Option<Subscription> {
        self.state.lock().subs.get(name).cloned()
    }

    /// Every subscription currently referencing `group`, as full records
    /// (used to rebuild sessions after a group mutation).
    #[must_use]
    pub fn subscriptions_in_group(&self, group: &str) -> Vec<Subscription> {
        let state = self.state.lock();
        state
            .users
            .get(group)
            .into_iter()
            .flatten()
            .filter_map(|name| state.subs.get(name).cloned())
            .collect()
    }

    /// Installs a session handle, replacing any previous one under the same
    /// name. The invariant of exactly one opened session per name is
    /// enforced by the caller closing the previous handle (if any) before
    /// calling this — see `reflector.rs`.
    pub fn install_session(&self, name: &str, handle: SessionHandle) {
        self.state.lock().sessions.insert(name.to_owned(), handle);
    }

    #[must_use]
    pub fn session(&self, name: &str) -> Option<SessionHandle> {
        self.state.lock().sessions.get(name).cloned()
    }

    pub fn remove_session(&self, name: &str) -> Option<SessionHandle> {
        self.state.lock().sessions.remove(name)
    }

    /// Closes and cancels every session referencing `group`, without
    /// removing them from `sessions` (the Reflector installs replacements
    /// in place — see `reflector.rs::restart_group`). Non-blocking.
    pub fn close_group_sessions(&self, group: &str) {
        let state = self.state.lock();
        for name in state.users.get(group).into_iter().flatten() {
            if let Some(handle) = state.sessions.get(name) {
                handle.close();
                handle.cancel();
            }
        }
    }

    /// Consistency check: for every subscription `s` with a non-empty
    /// group, `s.name` appears in `users[s.dst_group]`, and every name in
    /// `users[g]` maps back to a subscription with group `g`. Used by
    /// tests and available to callers that want a consistency assertion
    /// after a burst of configuration events.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();

        for sub in state.subs.values() {
            if let Some(group) = &sub.dst_group
                && !state
                    .users
                    .get(group)
                    .is_some_and(|names| names.iter().any(|n| n == &sub.name))
            {
                return false;
            }
        }

        for (group, names) in &state.users {
            for name in names {
                match state.subs.get(name) {
                    Some(sub) if sub.dst_group.as_deref() == Some(group.as_str()) => {}
                    _ => return false,
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReportType;

    fn sub(name: &str, group: Option<&str>) -> Subscription {
        let mut s = Subscription::new(name);
        s.dst_group = group.map(str::to_owned);
        s.report_type = ReportType::Stream;
        s
    }

    #[test]
    fn upsert_and_lookup_group() {
        let registry = Registry::new();
        registry.upsert_group("HS", vec!["127.0.0.1:8080".into()]);
        assert_eq!(
            registry.group_destinations("HS"),
            Some(vec!["127.0.0.1:8080".to_owned()])
        );
    }

    #[test]
    fn remove_group_in_use_is_rejected_and_unchanged() {
        let registry = Registry::new();
        registry.upsert_group("HS", vec!["127.0.0.1:8080".into()]);
        registry.upsert_subscription(sub("HS_RDMA", Some("HS")));

        let err = registry.remove_group("HS").unwrap_err();
        assert!(matches!(err, ConfigError::GroupInUse { .. }));
        assert!(registry.group_exists("HS"));
        assert_eq!(registry.subscription("HS_RDMA").unwrap().dst_group.as_deref(), Some("HS"));
    }

    #[test]
    fn remove_group_not_in_use_succeeds() {
        let registry = Registry::new();
        registry.upsert_group("HS", vec!["127.0.0.1:8080".into()]);
        registry.remove_group("HS").unwrap();
        assert!(!registry.group_exists("HS"));
    }

    #[test]
    fn subscription_moves_between_groups_update_user_lists() {
        let registry = Registry::new();
        registry.upsert_group("A", vec!["1.1.1.1:1".into()]);
        registry.upsert_group("B", vec!["2.2.2.2:2".into()]);
        registry.upsert_subscription(sub("X", Some("A")));
        assert_eq!(registry.group_users("A"), vec!["X".to_owned()]);

        registry.upsert_subscription(sub("X", Some("B")));
        assert!(registry.group_users("A").is_empty());
        assert_eq!(registry.group_users("B"), vec!["X".to_owned()]);
    }

    #[test]
    fn upsert_subscription_same_group_is_idempotent_and_ordered() {
        let registry = Registry::new();
        registry.upsert_group("A", vec!["1.1.1.1:1".into()]);
        registry.upsert_subscription(sub("X", Some("A")));
        registry.upsert_subscription(sub("Y", Some("A")));
        registry.upsert_subscription(sub("X", Some("A")));
        assert_eq!(registry.group_users("A"), vec!["X".to_owned(), "Y".to_owned()]);
    }

    #[test]
    fn remove_subscription_cleans_user_list() {
        let registry = Registry::new();
        registry.upsert_group("A", vec!["1.1.1.1:1".into()]);
        registry.upsert_subscription(sub("X", Some("A")));
        registry.remove_subscription("X");
        assert!(registry.group_users("A").is_empty());
        assert!(registry.subscription("X").is_none());
    }

    #[test]
    fn consistency_holds_after_a_sequence_of_events() {
        let registry = Registry::new();
        registry.upsert_group("A", vec!["1.1.1.1:1".into()]);
        registry.upsert_group("B", vec!["2.2.2.2:2".into()]);
        registry.upsert_subscription(sub("X", Some("A")));
        registry.upsert_subscription(sub("Y", None));
        registry.upsert_subscription(sub("Y", Some("B")));
        registry.remove_subscription("X");
        assert!(registry.is_consistent());
    }

    /// For any sequence of configuration events, the Registry's three maps
    /// stay mutually consistent once each event has been applied. Driven
    /// over randomized event sequences built from a small alphabet of
    /// group/subscription names, so the generator actually exercises
    /// cross-references and not just disjoint inserts.
    mod properties {
        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone)]
        enum Event {
            UpsertGroup { group: usize, destinations: Vec<String> },
            RemoveGroup { group: usize },
            UpsertSubscription { name: usize, group: Option<usize> },
            RemoveSubscription { name: usize },
        }

        const GROUPS: usize = 3;
        const SUBS: usize = 4;

        fn event_strategy() -> impl Strategy<Value = Event> {
            prop_oneof![
                (0..GROUPS, prop::collection::vec("[0-9]", 1..3)).prop_map(|(group, destinations)| {
                    Event::UpsertGroup {
                        group,
                        destinations: destinations.into_iter().map(|d| format!("10.0.0.{d}:80")).collect(),
                    }
                }),
                (0..GROUPS).prop_map(|group| Event::RemoveGroup { group }),
                (0..SUBS, prop::option::of(0..GROUPS))
                    .prop_map(|(name, group)| Event::UpsertSubscription { name, group }),
                (0..SUBS).prop_map(|name| Event::RemoveSubscription { name }),
            ]
        }

        fn apply(registry: &Registry, event: &Event) {
            match event {
                Event::UpsertGroup { group, destinations } => {
                    registry.upsert_group(&group.to_string(), destinations.clone());
                }
                Event::RemoveGroup { group } => {
                    let _ = registry.remove_group(&group.to_string());
                }
                Event::UpsertSubscription { name, group } => {
                    registry.upsert_subscription(sub(&name.to_string(), group.map(|g| g.to_string()).as_deref()));
                }
                Event::RemoveSubscription { name } => {
                    registry.remove_subscription(&name.to_string());
                }
            }
        }

        proptest! {
            #[test]
            fn registry_stays_consistent_after_any_event_sequence(events in prop::collection::vec(event_strategy(), 0..64)) {
                let registry = Registry::new();
                for event in &events {
                    apply(&registry, event);
                    prop_assert!(registry.is_consistent());
                }
            }
        }
    }
}
