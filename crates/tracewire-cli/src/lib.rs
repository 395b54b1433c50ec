// Copyright 2025 TraceWire Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # TraceWire CLI
//!
//! Command-line interface for TraceWire.
//!
//! ## Key Commands
//!
//! - `tracewire server`: Accept agent connections and log every batch received
//! - `tracewire ping`: Handshake with a server and measure PING round trips
//! - `tracewire send`: Ship a single trace and report the server's acknowledgement

pub mod commands;
