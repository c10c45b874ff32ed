// Copyright 2025 Buildmesh Contributors
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

pub mod api;
pub mod config;
pub mod db;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod service;
pub mod storage;

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
