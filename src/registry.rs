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

//! The switch's extension directory: a concurrent map from extension number to TU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use crate::conn::ClientConn;
use crate::tu::{Tu, UNREGISTERED_EXT};

const LOG_TARGET: &str = "pbx::registry";

pub struct Registry {
    tus: RwLock<HashMap<i32, Arc<Tu>>>,
    next_ext: AtomicI32,
    shutting_down: AtomicBool,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            tus: RwLock::new(HashMap::new()),
            next_ext: AtomicI32::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Assigns the next extension number, registers a new TU behind it, and sends the initial
    /// `ON_HOOK <ext>` notification.
    pub fn register(self: &Arc<Self>, conn: Box<dyn ClientConn>) -> Arc<Tu> {
        let ext = self.next_ext.fetch_add(1, Ordering::Relaxed);
        let tu = Tu::new(conn);
        tu.add_ref();
        tu.set_extension(ext);
        self.tus.write().expect("registry lock poisoned").insert(ext, tu.clone());
        tracing::info!(target: LOG_TARGET, ext, "TU registered");
        tu
    }

    pub fn lookup(&self, ext: i32) -> Option<Arc<Tu>> {
        self.tus.read().expect("registry lock poisoned").get(&ext).cloned()
    }

    /// Removes `tu` from the directory, hangs it up to cancel any in-progress call, and releases
    /// the registry's reference. Idempotent: a TU already removed by a racing unregister (e.g.
    /// its own disconnect racing a concurrent [`Registry::shutdown`]) is a no-op.
    pub fn unregister(&self, tu: &Arc<Tu>) {
        let ext = tu.extension();
        if ext == UNREGISTERED_EXT {
            return;
        }
        let removed = self
            .tus
            .write()
            .expect("registry lock poisoned")
            .remove(&ext)
            .is_some();
        if !removed {
            return;
        }
        tu.set_extension(UNREGISTERED_EXT);
        tu.hangup(self);
        tu.unref();
        tracing::info!(target: LOG_TARGET, ext, "TU unregistered");
    }

    /// Shuts down every registered TU: forces its reader to observe EOF and unregisters it. Safe
    /// to call more than once; only the first call does any work.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let snapshot: Vec<Arc<Tu>> = self
            .tus
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        tracing::info!(target: LOG_TARGET, count = snapshot.len(), "shutting down registry");
        for tu in snapshot {
            tu.shutdown_read();
            self.unregister(&tu);
        }
    }
}
