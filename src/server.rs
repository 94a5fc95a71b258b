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

//! Accepts incoming connections and services each on its own thread, one TU per connection.

use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::conn::TcpConn;
use crate::dispatcher::dispatch;
use crate::registry::Registry;

const LOG_TARGET: &str = "pbx::server";

pub fn run(port: u16, registry: Arc<Registry>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!(target: LOG_TARGET, port, "pbx listening");

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target: LOG_TARGET, %err, "failed to accept connection");
                continue;
            }
        };
        let registry = registry.clone();
        thread::spawn(move || serve_connection(stream, registry));
    }
    Ok(())
}

fn serve_connection(stream: TcpStream, registry: Arc<Registry>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let write_half = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!(target: LOG_TARGET, %peer, %err, "failed to clone connection for writing");
            return;
        }
    };

    let tu = registry.register(Box::new(TcpConn::new(write_half)));
    info!(target: LOG_TARGET, %peer, ext = tu.extension(), "connection accepted");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => dispatch(&tu, &registry, &line),
            Err(err) => {
                debug!(target: LOG_TARGET, %peer, %err, "read error, closing connection");
                break;
            }
        }
    }

    registry.unregister(&tu);
    info!(target: LOG_TARGET, %peer, "connection closed");
}
