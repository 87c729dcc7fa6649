// Copyright 2025 capdispatch Authors
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

//! # capdispatch CLI
//!
//! Command-line harness for exercising the capacity-aware dispatcher.
//!
//! ## Key Commands
//!
//! - `capdispatch simulate`: Drive a dispatcher with synthetic load and print
//!   the outcome counts together with the collected metrics as JSON
//! - `capdispatch check-config`: Validate a dispatcher configuration file

pub mod simulation;
