// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Random number utilities.

use rand::Rng;

/// Fill a byte slice with random bytes.
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill(buf);
}
