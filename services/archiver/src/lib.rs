// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Record archiver
//!
//! Moves records (a text body plus attachments) from the host application's
//! database and local storage into S3, tracking progress in migration runs
//! that survive crashes and restarts.

pub mod config;
pub mod context;
pub mod db;
pub mod memory;
pub mod metrics;
pub mod migration;
pub mod object_store;
pub mod queue;
pub mod report;
pub mod store;
