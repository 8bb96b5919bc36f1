/// Outbound context: client-side state for one remote hidden service
///
/// Owned by the endpoint and driven from its tick; async callbacks refer to
/// contexts by target address and re-look them up, so nothing here needs
/// shared ownership.

use super::address::{Address, ConvoTag};
use super::introset::{IntroSet, Introduction};
use super::protocol::SharedSecret;
use crate::util::DecayingHashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use veilnet_common::config::service::MIN_SHIFT_INTERVAL;
use veilnet_common::Timestamp;

/// Where the context is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No usable introduction known yet
    NoIntro,
    /// An introduction is selected but no path reaches it
    HaveIntro,
    /// A path to the selected introduction is being built
    Building,
    /// Path established, traffic can flow
    Ready,
    /// Given up; the endpoint drops failed contexts
    Failed,
}

pub struct OutboundContext {
    /// Remote service address this context converses with
    pub target: Address,

    state: ContextState,
    current_introset: IntroSet,
    current_intro: Option<Introduction>,
    next_intro: Option<Introduction>,

    /// Intros we refuse to use until their own expiry passes
    bad_intros: DecayingHashSet<Introduction>,

    pub build_fails: u16,
    pub lookup_fails: u16,

    last_shift: Timestamp,
    last_build_attempt: Timestamp,
    last_inbound_traffic: Timestamp,
    got_inbound_traffic: bool,
    created_at: Timestamp,

    /// Conversation state with the remote
    pub tag: ConvoTag,
    pub shared_secret: Option<SharedSecret>,
    seqno: u64,
}

/// Without inbound traffic for this long a context is dead
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for the first inbound traffic after creation
const INITIAL_TRAFFIC_GRACE: Duration = Duration::from_secs(30);

/// Pacing between build attempts
const BUILD_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Build failures before the context gives up
const MAX_BUILD_FAILS: u16 = 10;

impl OutboundContext {
    pub fn new(introset: IntroSet, now: Timestamp) -> Self {
        let mut ctx = Self {
            target: introset.address,
            state: ContextState::NoIntro,
            current_introset: introset,
            current_intro: None,
            next_intro: None,
            bad_intros: DecayingHashSet::new(MIN_SHIFT_INTERVAL),
            build_fails: 0,
            lookup_fails: 0,
            last_shift: Timestamp::ZERO,
            last_build_attempt: Timestamp::ZERO,
            last_inbound_traffic: Timestamp::ZERO,
            got_inbound_traffic: false,
            created_at: now,
            tag: ConvoTag::random(),
            shared_secret: None,
            seqno: 0,
        };
        ctx.select_intro(now);
        ctx
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn current_intro(&self) -> Option<Introduction> {
        self.current_intro
    }

    pub fn next_intro(&self) -> Option<Introduction> {
        self.next_intro
    }

    pub fn introset(&self) -> &IntroSet {
        &self.current_introset
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn next_seqno(&mut self) -> u64 {
        let n = self.seqno;
        self.seqno += 1;
        n
    }

    /// Feed a newer introset; stale versions are ignored
    pub fn update_introset(&mut self, introset: IntroSet, now: Timestamp) -> bool {
        if introset.address != self.target || introset.version <= self.current_introset.version {
            return false;
        }
        debug!(target = %self.target, version = introset.version, "introset updated");
        self.current_introset = introset;
        if matches!(self.state, ContextState::NoIntro | ContextState::Failed) {
            self.select_intro(now);
        }
        true
    }

    /// Pick the best unexpired, not-bad introduction as the next intro
    ///
    /// "Best" is the one with the latest expiry; with nothing usable the
    /// context fails. Rate limited between shifts.
    pub fn shift_introduction(&mut self, now: Timestamp) -> bool {
        if now.since(self.last_shift) < MIN_SHIFT_INTERVAL && self.last_shift != Timestamp::ZERO {
            return false;
        }

        let candidates: Vec<Introduction> = self
            .current_introset
            .usable_intros(now)
            .into_iter()
            .filter(|i| !self.bad_intros.contains(i))
            .filter(|i| Some(*i) != self.current_intro)
            .collect();

        let Some(best) = candidates.iter().max_by_key(|i| i.expires_at).copied() else {
            // nothing left to shift to
            if self
                .current_intro
                .map(|i| i.is_expired(now) || self.bad_intros.contains(&i))
                .unwrap_or(true)
            {
                warn!(target = %self.target, "no usable introductions, context failed");
                self.state = ContextState::Failed;
            }
            return false;
        };

        self.last_shift = now;
        self.next_intro = Some(best);
        if self.state == ContextState::Ready {
            // the active intro is being abandoned, a rebuild is needed
            self.state = ContextState::HaveIntro;
        } else if self.state == ContextState::NoIntro {
            self.state = ContextState::HaveIntro;
        }
        debug!(target = %self.target, intro = %best.router, "shifted introduction");
        true
    }

    /// Blacklist the current intro until its own expiry and shift away
    pub fn mark_current_intro_bad(&mut self, now: Timestamp) -> bool {
        if let Some(intro) = self.current_intro {
            self.bad_intros.insert_until(intro, intro.expires_at);
            info!(target = %self.target, intro = %intro.router, "marked introduction bad");
        }
        self.shift_introduction(now)
    }

    /// Whether the endpoint should request a path build for this context
    pub fn should_build(&self, now: Timestamp) -> bool {
        self.state == ContextState::HaveIntro
            && self.next_intro.is_some()
            && now.since(self.last_build_attempt) >= BUILD_RETRY_INTERVAL
    }

    /// The intro the next build should terminate at
    pub fn build_target(&self) -> Option<Introduction> {
        self.next_intro.or(self.current_intro)
    }

    pub fn build_started(&mut self, now: Timestamp) {
        self.last_build_attempt = now;
        self.state = ContextState::Building;
    }

    /// A path to the pending intro came up
    pub fn handle_path_built(&mut self) {
        if let Some(next) = self.next_intro.take() {
            self.current_intro = Some(next);
        }
        self.build_fails = 0;
        self.state = ContextState::Ready;
    }

    /// The build timed out or was rejected
    pub fn handle_build_failed(&mut self, now: Timestamp) {
        self.build_fails = self.build_fails.saturating_add(1);
        self.state = ContextState::HaveIntro;
        if self.build_fails as usize % 3 == 0 {
            // repeated failures suggest the intro router is the problem
            self.mark_current_intro_bad(now);
        }
        if self.build_fails >= MAX_BUILD_FAILS {
            warn!(target = %self.target, fails = self.build_fails, "too many build failures");
            self.state = ContextState::Failed;
        }
    }

    pub fn ready_to_send(&self, now: Timestamp) -> bool {
        self.state == ContextState::Ready
            && self
                .current_intro
                .map(|i| !i.is_expired(now))
                .unwrap_or(false)
    }

    pub fn record_inbound_traffic(&mut self, now: Timestamp) {
        self.got_inbound_traffic = true;
        self.last_inbound_traffic = now;
    }

    /// Per-tick maintenance; returns true when the context is dead and the
    /// endpoint should drop it
    pub fn pump(&mut self, now: Timestamp) -> bool {
        self.bad_intros.decay(now);

        // active intro ran out: shift away
        if self.state == ContextState::Ready {
            if let Some(intro) = self.current_intro {
                if intro.is_expired(now) {
                    self.shift_introduction(now);
                }
            }
        }

        if self.state == ContextState::Failed {
            return true;
        }

        // conversation went quiet
        if self.got_inbound_traffic {
            if now.since(self.last_inbound_traffic) > IDLE_TIMEOUT {
                debug!(target = %self.target, "context idle, dropping");
                self.state = ContextState::Failed;
                return true;
            }
        } else if now.since(self.created_at) > INITIAL_TRAFFIC_GRACE
            && self.state != ContextState::Ready
        {
            debug!(target = %self.target, "context never became ready, dropping");
            self.state = ContextState::Failed;
            return true;
        }

        false
    }

    fn select_intro(&mut self, now: Timestamp) {
        let usable: Vec<Introduction> = self
            .current_introset
            .usable_intros(now)
            .into_iter()
            .filter(|i| !self.bad_intros.contains(i))
            .collect();
        if let Some(best) = usable.iter().max_by_key(|i| i.expires_at).copied() {
            self.next_intro = Some(best);
            self.state = ContextState::HaveIntro;
        } else {
            self.state = ContextState::NoIntro;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, RouterId};
    use crate::path::PathId;

    fn intro(b: u8, expires_at: Timestamp) -> Introduction {
        Introduction {
            router: RouterId::from_bytes([b; 32]),
            path_id: PathId::random(),
            expires_at,
        }
    }

    fn introset(identity: &Identity, intros: Vec<Introduction>, version: u64) -> IntroSet {
        IntroSet::create(
            identity,
            [5u8; 32],
            intros,
            version,
            Timestamp::from_millis(1_000_000),
        )
    }

    fn ctx_with_three_intros() -> (OutboundContext, [Introduction; 3], Timestamp) {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(10_000);
        let i1 = intro(1, Timestamp::from_millis(100_000));
        let i2 = intro(2, Timestamp::from_millis(200_000));
        let i3 = intro(3, Timestamp::from_millis(300_000));
        let ctx = OutboundContext::new(introset(&identity, vec![i1, i2, i3], 1), now);
        (ctx, [i1, i2, i3], now)
    }

    #[test]
    fn test_new_context_selects_latest_expiring_intro() {
        let (ctx, [_, _, i3], _) = ctx_with_three_intros();
        assert_eq!(ctx.state(), ContextState::HaveIntro);
        assert_eq!(ctx.next_intro(), Some(i3));
    }

    #[test]
    fn test_build_lifecycle() {
        let (mut ctx, [_, _, i3], now) = ctx_with_three_intros();
        assert!(ctx.should_build(now));

        ctx.build_started(now);
        assert_eq!(ctx.state(), ContextState::Building);
        assert!(!ctx.should_build(now));

        ctx.handle_path_built();
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(ctx.current_intro(), Some(i3));
        assert!(ctx.ready_to_send(now));
    }

    #[test]
    fn test_build_failure_returns_to_have_intro() {
        let (mut ctx, _, now) = ctx_with_three_intros();
        ctx.build_started(now);
        ctx.handle_build_failed(now);

        assert_eq!(ctx.state(), ContextState::HaveIntro);
        assert_eq!(ctx.build_fails, 1);
    }

    #[test]
    fn test_mark_bad_walks_down_the_expiry_order() {
        let (mut ctx, [i1, i2, i3], now) = ctx_with_three_intros();
        ctx.build_started(now);
        ctx.handle_path_built();
        assert_eq!(ctx.current_intro(), Some(i3));

        // marking i3 bad selects i2 (next-latest expiry)
        let shifted = ctx.mark_current_intro_bad(now);
        assert!(shifted);
        assert_eq!(ctx.next_intro(), Some(i2));
        assert_eq!(ctx.state(), ContextState::HaveIntro);

        ctx.build_started(now);
        ctx.handle_path_built();
        assert_eq!(ctx.current_intro(), Some(i2));

        // shift rate limit: too soon to shift again
        assert!(!ctx.mark_current_intro_bad(now));

        let later = now.add(MIN_SHIFT_INTERVAL);
        let shifted = ctx.mark_current_intro_bad(later);
        assert!(shifted);
        assert_eq!(ctx.next_intro(), Some(i1));
    }

    #[test]
    fn test_all_intros_bad_fails_context() {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(10_000);
        let only = intro(1, Timestamp::from_millis(100_000));
        let mut ctx = OutboundContext::new(introset(&identity, vec![only], 1), now);

        ctx.build_started(now);
        ctx.handle_path_built();

        let shifted = ctx.mark_current_intro_bad(now);
        assert!(!shifted);
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn test_update_introset_ignores_stale_versions() {
        let identity = Identity::generate();
        let now = Timestamp::from_millis(10_000);
        let mut ctx = OutboundContext::new(
            introset(&identity, vec![intro(1, Timestamp::from_millis(50_000))], 5),
            now,
        );

        let stale = introset(&identity, vec![intro(2, Timestamp::from_millis(60_000))], 4);
        assert!(!ctx.update_introset(stale, now));

        let fresh = introset(&identity, vec![intro(2, Timestamp::from_millis(60_000))], 6);
        assert!(ctx.update_introset(fresh, now));
        assert_eq!(ctx.introset().version, 6);
    }

    #[test]
    fn test_pump_drops_idle_context() {
        let (mut ctx, _, now) = ctx_with_three_intros();
        ctx.build_started(now);
        ctx.handle_path_built();
        ctx.record_inbound_traffic(now);

        assert!(!ctx.pump(now));

        let idle = now.add(IDLE_TIMEOUT).add(Duration::from_secs(1));
        assert!(ctx.pump(idle));
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn test_seqno_is_monotone() {
        let (mut ctx, _, _) = ctx_with_three_intros();
        assert_eq!(ctx.next_seqno(), 0);
        assert_eq!(ctx.next_seqno(), 1);
        assert_eq!(ctx.next_seqno(), 2);
    }
}
