// Copyright 2024. The Tari Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! A telephone unit (TU): one end of the switch, holding call state for a single connected
//! client and the wire behind it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::conn::ClientConn;
use crate::error::{PbxError, PbxResult};
use crate::registry::Registry;

const LOG_TARGET: &str = "pbx::tu";

/// Extension value used while a TU is not (or no longer) registered with a [`Registry`].
pub const UNREGISTERED_EXT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuState {
    OnHook,
    DialTone,
    RingBack,
    Ringing,
    Connected,
    BusySignal,
    Error,
}

struct TuInner {
    state: TuState,
    ext: i32,
    peer_ext: Option<i32>,
    /// Logical reference count, mirroring the original design's `tu_ref`/`tu_unref`
    /// bookkeeping. Rust's `Arc` already manages the TU's memory; this field exists purely so
    /// tests can assert the call-accounting invariant independently of when the backing
    /// allocation is actually freed.
    refs: u32,
}

/// A telephone unit. Call state lives behind `inner`; the network write-half lives behind `out`
/// so that a notification can be sent while `inner` is unlocked (and vice versa), avoiding lock
/// order inversions between the two.
pub struct Tu {
    inner: Mutex<TuInner>,
    out: Mutex<Box<dyn ClientConn>>,
}

impl Tu {
    pub fn new(conn: Box<dyn ClientConn>) -> Arc<Tu> {
        Arc::new(Tu {
            inner: Mutex::new(TuInner {
                state: TuState::OnHook,
                ext: UNREGISTERED_EXT,
                peer_ext: None,
                refs: 0,
            }),
            out: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TuInner> {
        self.inner.lock().expect("TU mutex poisoned")
    }

    pub fn extension(&self) -> i32 {
        self.lock().ext
    }

    /// Alias retained from the design this switch is modeled on, where a TU's extension and its
    /// underlying connection descriptor were the same value.
    pub fn fileno(&self) -> i32 {
        self.extension()
    }

    pub fn state(&self) -> TuState {
        self.lock().state
    }

    pub fn peer_extension(&self) -> Option<i32> {
        self.lock().peer_ext
    }

    pub fn ref_count(&self) -> u32 {
        self.lock().refs
    }

    pub fn add_ref(&self) {
        self.lock().refs += 1;
    }

    pub fn unref(&self) {
        let mut guard = self.lock();
        guard.refs = guard
            .refs
            .checked_sub(1)
            .expect("TU reference count underflow");
    }

    /// Assigns (or clears, with [`UNREGISTERED_EXT`]) the extension number and, when assigning a
    /// real extension, sends the initial `ON_HOOK <ext>` notification.
    pub fn set_extension(&self, ext: i32) {
        self.lock().ext = ext;
        if ext != UNREGISTERED_EXT {
            self.send(&format!("ON_HOOK {}\n", ext));
        }
    }

    pub fn shutdown_read(&self) {
        self.out.lock().expect("TU out mutex poisoned").shutdown_read();
    }

    fn send(&self, text: &str) {
        let mut out = self.out.lock().expect("TU out mutex poisoned");
        if let Err(err) = out.send(text.as_bytes()) {
            tracing::debug!(target: LOG_TARGET, %err, "notification write failed, client likely disconnected");
        }
    }

    fn current_notification(&self) -> String {
        let guard = self.lock();
        match guard.state {
            TuState::OnHook => format!("ON_HOOK {}\n", guard.ext),
            TuState::DialTone => "DIAL_TONE\n".to_string(),
            TuState::RingBack => "RING_BACK\n".to_string(),
            TuState::Ringing => "RINGING\n".to_string(),
            TuState::BusySignal => "BUSY_SIGNAL\n".to_string(),
            TuState::Error => "ERROR\n".to_string(),
            TuState::Connected => format!(
                "CONNECTED {}\n",
                guard.peer_ext.expect("CONNECTED implies a peer extension")
            ),
        }
    }

    fn emit_current_state(&self) {
        let line = self.current_notification();
        self.send(&line);
    }

    /// `pickup()`: ON_HOOK -> DIAL_TONE; RINGING (with a still-live caller) -> CONNECTED on both
    /// ends; any other state is a no-op that just re-announces the current state.
    pub fn pickup(self: &Arc<Tu>, registry: &Registry) {
        let snapshot = {
            let guard = self.lock();
            (guard.state, guard.peer_ext)
        };

        match snapshot {
            (TuState::OnHook, _) => {
                self.lock().state = TuState::DialTone;
                self.send("DIAL_TONE\n");
            }
            (TuState::Ringing, Some(caller_ext)) => {
                let Some(caller) = registry.lookup(caller_ext) else {
                    self.emit_current_state();
                    return;
                };
                let (mut a, mut b) = lock_pair(self, &caller);
                if a.state != TuState::Ringing || a.peer_ext != Some(b.ext) {
                    drop(a);
                    drop(b);
                    self.emit_current_state();
                    return;
                }
                a.state = TuState::Connected;
                b.state = TuState::Connected;
                let self_ext = a.ext;
                let caller_ext_now = b.ext;
                drop(a);
                drop(b);
                self.add_ref();
                caller.add_ref();
                self.send(&format!("CONNECTED {}\n", caller_ext_now));
                caller.send(&format!("CONNECTED {}\n", self_ext));
            }
            _ => self.emit_current_state(),
        }
    }

    /// `dial(ext)`: only valid from DIAL_TONE. Self-dial or an unknown extension answers
    /// BUSY_SIGNAL / ERROR without touching any peer; dialing a live, idle target rings both
    /// ends (RING_BACK / RINGING); dialing a busy or already-paired target answers BUSY_SIGNAL.
    pub fn dial(self: &Arc<Tu>, registry: &Registry, ext: i32) -> PbxResult<()> {
        {
            let guard = self.lock();
            if guard.state != TuState::DialTone {
                drop(guard);
                self.emit_current_state();
                return Ok(());
            }
        }

        let Some(target) = registry.lookup(ext) else {
            self.lock().state = TuState::Error;
            self.send("ERROR\n");
            return Err(PbxError::NoSuchExtension(ext));
        };

        if Arc::ptr_eq(self, &target) {
            self.lock().state = TuState::BusySignal;
            self.send("BUSY_SIGNAL\n");
            return Ok(());
        }

        let (mut a, mut b) = lock_pair(self, &target);
        if a.ext == UNREGISTERED_EXT || a.state != TuState::DialTone {
            // Self moved off DIAL_TONE between the snapshot above and this lock: either torn
            // down by a concurrent shutdown/hangup (ext flipped to UNREGISTERED_EXT), or paired
            // as someone else's dial target. Either way whatever transition did that already sent
            // self its own notification (or self is closing and there is nothing to notify), so
            // this dial is abandoned silently rather than echoing a second, stale notification.
            drop(a);
            drop(b);
            return Ok(());
        }
        if b.ext == UNREGISTERED_EXT || b.peer_ext.is_some() || b.state != TuState::OnHook {
            // Either the target already raced into a call/busy state, or it disconnected and
            // `Registry::unregister` flipped its ext to UNREGISTERED_EXT without ever touching
            // its (already ON_HOOK) state: without the ext check that stale TU would otherwise
            // look idle and be paired with a now-dangling extension.
            a.state = TuState::BusySignal;
            drop(a);
            drop(b);
            self.send("BUSY_SIGNAL\n");
            return Ok(());
        }

        a.state = TuState::RingBack;
        b.state = TuState::Ringing;
        a.peer_ext = Some(b.ext);
        b.peer_ext = Some(a.ext);
        drop(a);
        drop(b);
        self.send("RING_BACK\n");
        target.send("RINGING\n");
        Ok(())
    }

    /// `hangup()`: always succeeds and is idempotent. Tears down an in-progress or ringing pair
    /// symmetrically (restoring both sides to an unpaired state) and otherwise just settles this
    /// TU to ON_HOOK.
    pub fn hangup(self: &Arc<Tu>, registry: &Registry) {
        let snapshot = {
            let guard = self.lock();
            (guard.state, guard.peer_ext)
        };

        match snapshot {
            (TuState::Connected | TuState::Ringing | TuState::RingBack, Some(peer_ext)) => {
                self.detach_pair(registry, peer_ext, snapshot.0);
            }
            (TuState::Connected | TuState::Ringing | TuState::RingBack, None) => {
                self.settle_on_hook();
            }
            (TuState::OnHook, _) => self.emit_current_state(),
            (TuState::DialTone | TuState::BusySignal | TuState::Error, _) => {
                self.settle_on_hook();
            }
        }
    }

    fn settle_on_hook(&self) {
        let ext = {
            let mut guard = self.lock();
            guard.state = TuState::OnHook;
            guard.peer_ext = None;
            guard.ext
        };
        self.send(&format!("ON_HOOK {}\n", ext));
    }

    fn detach_pair(self: &Arc<Tu>, registry: &Registry, peer_ext: i32, expected_state: TuState) {
        let Some(peer) = registry.lookup(peer_ext) else {
            // Peer already unregistered and tore itself down first; nothing left to detach.
            self.settle_on_hook();
            return;
        };

        let (mut a, mut b) = lock_pair(self, &peer);
        if a.state != expected_state || a.peer_ext != Some(b.ext) {
            // Lost the race: a concurrent hangup on the other side already unwound the pair.
            drop(a);
            drop(b);
            self.emit_current_state();
            return;
        }

        let was_connected = a.state == TuState::Connected;
        a.state = TuState::OnHook;
        b.state = if expected_state == TuState::RingBack {
            TuState::OnHook
        } else {
            TuState::DialTone
        };
        a.peer_ext = None;
        b.peer_ext = None;
        let self_ext = a.ext;
        let peer_ext_now = b.ext;
        let peer_next_line = match b.state {
            TuState::OnHook => format!("ON_HOOK {}\n", peer_ext_now),
            TuState::DialTone => "DIAL_TONE\n".to_string(),
            _ => unreachable!("hangup only settles peers to ON_HOOK or DIAL_TONE"),
        };
        drop(a);
        drop(b);

        if was_connected {
            self.unref();
            peer.unref();
        }

        self.send(&format!("ON_HOOK {}\n", self_ext));
        peer.send(&peer_next_line);
    }

    /// `chat(msg)`: only valid while CONNECTED; forwards `msg` to the peer verbatim (including
    /// its trailing line terminator) and re-announces this TU's own CONNECTED state.
    pub fn chat(&self, registry: &Registry, msg: &str) -> PbxResult<()> {
        let (state, peer_ext, self_ext) = {
            let guard = self.lock();
            (guard.state, guard.peer_ext, guard.ext)
        };

        if state != TuState::Connected {
            self.emit_current_state();
            return Err(PbxError::NotConnected);
        }

        let peer_ext = peer_ext.expect("CONNECTED implies a peer extension");
        match registry.lookup(peer_ext) {
            Some(peer) => peer.send(&format!("CHAT {}", msg)),
            None => tracing::debug!(
                target: LOG_TARGET,
                ext = self_ext,
                peer_ext,
                "chat: peer vanished before delivery"
            ),
        }
        self.send(&format!("CONNECTED {}\n", peer_ext));
        Ok(())
    }
}

/// Locks two TUs in a canonical order derived from their stable allocation address, so that any
/// two threads locking the same pair always acquire the mutexes in the same order regardless of
/// which TU initiated the operation.
fn lock_pair<'a>(a: &'a Arc<Tu>, b: &'a Arc<Tu>) -> (MutexGuard<'a, TuInner>, MutexGuard<'a, TuInner>) {
    let a_addr = Arc::as_ptr(a) as usize;
    let b_addr = Arc::as_ptr(b) as usize;
    if a_addr <= b_addr {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::registry::Registry;
    use crate::testutil::RecordingConn;

    fn make_tu(registry: &Arc<Registry>) -> (Arc<Tu>, RecordingConn) {
        let conn = RecordingConn::new();
        let tu = registry.register(Box::new(conn.clone()));
        (tu, conn)
    }

    #[test]
    fn pickup_from_on_hook_gives_dial_tone() {
        let registry = Registry::new();
        let (tu, conn) = make_tu(&registry);
        tu.pickup(&registry);
        assert_eq!(tu.state(), TuState::DialTone);
        assert_eq!(conn.last().as_deref(), Some("DIAL_TONE\n"));
    }

    #[test]
    fn dial_self_is_busy() {
        let registry = Registry::new();
        let (tu, conn) = make_tu(&registry);
        tu.pickup(&registry);
        let ext = tu.extension();
        tu.dial(&registry, ext).unwrap();
        assert_eq!(tu.state(), TuState::BusySignal);
        assert_eq!(conn.last().as_deref(), Some("BUSY_SIGNAL\n"));
    }

    #[test]
    fn dial_unknown_extension_is_error() {
        let registry = Registry::new();
        let (tu, conn) = make_tu(&registry);
        tu.pickup(&registry);
        let err = tu.dial(&registry, 9999).unwrap_err();
        assert!(matches!(err, PbxError::NoSuchExtension(9999)));
        assert_eq!(tu.state(), TuState::Error);
        assert_eq!(conn.last().as_deref(), Some("ERROR\n"));
    }

    #[test]
    fn full_round_trip_call_and_teardown() {
        let registry = Registry::new();
        let (a, a_conn) = make_tu(&registry);
        let (b, b_conn) = make_tu(&registry);

        a.pickup(&registry);
        let b_ext = b.extension();
        a.dial(&registry, b_ext).unwrap();
        assert_eq!(a.state(), TuState::RingBack);
        assert_eq!(b.state(), TuState::Ringing);
        assert_eq!(b_conn.last().as_deref(), Some("RINGING\n"));

        b.pickup(&registry);
        assert_eq!(a.state(), TuState::Connected);
        assert_eq!(b.state(), TuState::Connected);
        let a_ext = a.extension();
        assert_eq!(a_conn.last(), Some(format!("CONNECTED {}\n", b_ext)));
        assert_eq!(b_conn.last(), Some(format!("CONNECTED {}\n", a_ext)));
        assert_eq!(a.ref_count(), 2); // registry + call
        assert_eq!(b.ref_count(), 2);

        a.chat(&registry, "hello\n").unwrap();
        assert_eq!(b_conn.last().as_deref(), Some("CHAT hello\n"));
        assert_eq!(a_conn.last(), Some(format!("CONNECTED {}\n", b_ext)));

        a.hangup(&registry);
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::DialTone);
        assert_eq!(b_conn.last().as_deref(), Some("DIAL_TONE\n"));
        assert_eq!(a.ref_count(), 1); // registry only, call ref released
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn hangup_is_idempotent() {
        let registry = Registry::new();
        let (a, _a_conn) = make_tu(&registry);
        let (b, _b_conn) = make_tu(&registry);
        a.pickup(&registry);
        let b_ext = b.extension();
        a.dial(&registry, b_ext).unwrap();
        b.pickup(&registry);

        a.hangup(&registry);
        let state_after_first = a.state();
        a.hangup(&registry);
        assert_eq!(a.state(), state_after_first);
        assert_eq!(a.state(), TuState::OnHook);
    }

    #[test]
    fn busy_target_rejects_second_caller() {
        let registry = Registry::new();
        let (a, _) = make_tu(&registry);
        let (b, _) = make_tu(&registry);
        let (c, c_conn) = make_tu(&registry);

        a.pickup(&registry);
        b.pickup(&registry);
        c.pickup(&registry);
        let b_ext = b.extension();
        a.dial(&registry, b_ext).unwrap();
        c.dial(&registry, b_ext).unwrap();
        assert_eq!(c.state(), TuState::BusySignal);
        assert_eq!(c_conn.last().as_deref(), Some("BUSY_SIGNAL\n"));
    }

    /// Races `dial` against a concurrent disconnect of its target. `Registry::unregister` flips
    /// the target's `ext` to [`UNREGISTERED_EXT`] and only afterwards calls `hangup` on it, so
    /// there is a window where a TU is simultaneously unregistered and still reporting
    /// `state == OnHook`. Run enough iterations for the scheduler to land `dial`'s re-check
    /// inside that window at least once; whichever way the race actually falls, `dial` must never
    /// pair `self` with a target that is no longer registered.
    #[test]
    fn dial_never_pairs_with_a_concurrently_unregistering_target() {
        for _ in 0..500 {
            let registry = Registry::new();
            let (a, _a_conn) = make_tu(&registry);
            let (b, _b_conn) = make_tu(&registry);
            a.pickup(&registry);
            let b_ext = b.extension();

            let unregistering_registry = registry.clone();
            let b_for_thread = b.clone();
            let unregister_thread =
                thread::spawn(move || unregistering_registry.unregister(&b_for_thread));

            let _ = a.dial(&registry, b_ext);
            unregister_thread.join().expect("unregister thread panicked");

            match a.state() {
                TuState::RingBack => {
                    // Only acceptable if `b` really is still the live, paired extension.
                    assert_ne!(b.extension(), UNREGISTERED_EXT);
                    assert_eq!(b.state(), TuState::Ringing);
                    assert_eq!(a.peer_extension(), Some(b_ext));
                    assert_eq!(b.peer_extension(), Some(a.extension()));
                }
                TuState::BusySignal | TuState::Error => {
                    assert_eq!(a.peer_extension(), None);
                }
                other => panic!("dial left `a` in an unexpected post-race state: {other:?}"),
            }
        }
    }
}
