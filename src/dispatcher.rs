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

//! Parses a single line of client input into a command and dispatches it against a TU.
//!
//! Unrecognized commands, a malformed `dial` argument, and the empty line are all silent no-ops:
//! none of them advance or announce TU state.

use std::sync::Arc;

use crate::registry::Registry;
use crate::tu::Tu;

pub fn dispatch(tu: &Arc<Tu>, registry: &Registry, raw_line: &str) {
    let trimmed = raw_line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return;
    }

    let (cmd, _) = match trimmed.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (trimmed, ""),
    };

    match cmd {
        "pickup" => tu.pickup(registry),
        "hangup" => tu.hangup(registry),
        "dial" => {
            let arg = trimmed.split_once(' ').map(|(_, r)| r.trim()).unwrap_or("");
            if let Ok(ext) = arg.parse::<i32>() {
                let _ = tu.dial(registry, ext);
            }
        }
        "chat" => {
            // Forward the remainder of the *untrimmed* line so the peer receives the sender's
            // own line terminator verbatim, not the CRLF-stripped copy used for command parsing.
            let payload = raw_line
                .find(' ')
                .map(|idx| &raw_line[idx + 1..])
                .unwrap_or("");
            let _ = tu.chat(registry, payload);
        }
        _ => {}
    }
}
