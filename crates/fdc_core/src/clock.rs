/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    fdc_core::clock.rs

    Millisecond time source used for every timeout and delay in the driver.
    
    SystemClock measures wall time. VirtualClock is a shared counter advanced
    explicitly, so a simulated controller can model rotation and seek time
    without the tests ever sleeping.
*/

use std::{cell::Cell, rc::Rc};

use cfg_if::cfg_if;
use web_time::{Duration, Instant};

pub trait Clock {
    /// Milliseconds elapsed since some fixed origin.
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);

    /// Absolute time `ms` milliseconds from now.
    fn deadline(&self, ms: u64) -> u64 {
        self.now_ms().saturating_add(ms)
    }
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u64) {
        cfg_if! {
            if #[cfg(target_arch = "wasm32")] {
                let until = Instant::now() + Duration::from_millis(ms);
                while Instant::now() < until {
                    std::hint::spin_loop();
                }
            }
            else {
                std::thread::sleep(Duration::from_millis(ms));
            }
        }
    }
}

/// A clock that only moves when told to. Clones share the same counter.
#[derive(Clone, Debug, Default)]
pub struct VirtualClock {
    ticks: Rc<Cell<u64>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.ticks.set(self.ticks.get().saturating_add(ms));
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.ticks.get()
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.advance(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_shared() {
        let clock = VirtualClock::new();
        let mut other = clock.clone();
        other.sleep_ms(40);
        clock.advance(2);
        assert_eq!(clock.now_ms(), 42);
        assert_eq!(other.deadline(8), 50);
    }
}
