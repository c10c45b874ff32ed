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

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    /// Used when `RUST_LOG` is not set.
    pub default_env_filter: String,
    pub json: bool,
    pub ansi: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_env_filter: "info".to_string(),
            json: false,
            ansi: true,
        }
    }

    pub fn production(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_env_filter: "info".to_string(),
            json: true,
            ansi: false,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("buildmesh")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "default filter: {}", self.default_env_filter);
        let _ = writeln!(&mut result, "json: {}", self.json);
        result
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// default filter.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_env_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
