//! Bit-banged 10-bit water-level ADC driver (collaborator contract, spec
//! §6.1). Three GPIO lines: `reset_n` and `next_n` are open-collector
//! active-low strobes, `data` is an input. Grounded on
//! `examples/original_source/inputs/adc.py`'s `gpiozero`-based driver,
//! generalized behind a `GpioLine` trait so it can run against real sysfs
//! GPIO on a Raspberry Pi or an in-memory fake under test.

use std::time::Duration;

use tokio::time::sleep;

/// One GPIO line, read or written as a boolean level.
pub trait GpioLine: Send {
    fn set(&mut self, high: bool);
    fn get(&self) -> bool;
}

/// `/sys/class/gpio`-backed output line. Real Raspberry Pi deployments use
/// this; no GPIO crate appears anywhere in the reference corpus, so this
/// narrow, explicitly out-of-scope collaborator talks to sysfs directly
/// rather than adding an unvetted dependency.
pub struct SysfsOutput {
    value_path: std::path::PathBuf,
}

impl SysfsOutput {
    pub fn export(pin: u32) -> std::io::Result<Self> {
        export_pin(pin, "out")?;
        Ok(Self {
            value_path: gpio_value_path(pin),
        })
    }
}

impl GpioLine for SysfsOutput {
    fn set(&mut self, high: bool) {
        let _ = std::fs::write(&self.value_path, if high { b"1" as &[u8] } else { b"0" });
    }

    fn get(&self) -> bool {
        std::fs::read_to_string(&self.value_path)
            .map(|s| s.trim() == "1")
            .unwrap_or(false)
    }
}

pub struct SysfsInput {
    value_path: std::path::PathBuf,
}

impl SysfsInput {
    pub fn export(pin: u32) -> std::io::Result<Self> {
        export_pin(pin, "in")?;
        Ok(Self {
            value_path: gpio_value_path(pin),
        })
    }
}

impl GpioLine for SysfsInput {
    fn set(&mut self, _high: bool) {}

    fn get(&self) -> bool {
        std::fs::read_to_string(&self.value_path)
            .map(|s| s.trim() == "1")
            .unwrap_or(false)
    }
}

fn gpio_value_path(pin: u32) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/sys/class/gpio/gpio{pin}/value"))
}

fn export_pin(pin: u32, direction: &str) -> std::io::Result<()> {
    let base = std::path::PathBuf::from(format!("/sys/class/gpio/gpio{pin}"));
    if !base.exists() {
        std::fs::write("/sys/class/gpio/export", pin.to_string().as_bytes())?;
    }
    std::fs::write(base.join("direction"), direction.as_bytes())?;
    Ok(())
}

/// In-memory fake used by tests and by anyone developing off real hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeLine {
    level: bool,
}

impl GpioLine for FakeLine {
    fn set(&mut self, high: bool) {
        self.level = high;
    }

    fn get(&self) -> bool {
        self.level
    }
}

/// Drives the reset/next/data pulse protocol to read one 10-bit value.
pub struct Adc<R, N, D> {
    reset_n: R,
    next_n: N,
    data: D,
    bit_delay: Duration,
}

impl<R: GpioLine, N: GpioLine, D: GpioLine> Adc<R, N, D> {
    pub fn new(reset_n: R, next_n: N, data: D, bit_delay: Duration) -> Self {
        Self {
            reset_n,
            next_n,
            data,
            bit_delay,
        }
    }

    async fn reset(&mut self) {
        self.reset_n.set(false);
        sleep(self.bit_delay).await;
        self.reset_n.set(true);
        sleep(self.bit_delay).await;
    }

    async fn next_bit(&mut self) -> bool {
        self.next_n.set(false);
        sleep(self.bit_delay).await;
        self.next_n.set(true);
        sleep(self.bit_delay).await;
        self.data.get()
    }

    /// Pulses `reset_n` low then high, then ten cycles of `next_n` low to
    /// high, sampling `data` after each pulse and assembling a 10-bit
    /// integer LSB first.
    pub async fn readout(&mut self) -> u16 {
        self.reset().await;
        let mut value: u16 = 0;
        for i in 0..10 {
            if self.next_bit().await {
                value |= 1 << i;
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readout_assembles_bits_lsb_first() {
        // Fake lines that always read high: every bit set -> 0b11_1111_1111
        let mut adc = Adc::new(
            FakeLine::default(),
            FakeLine::default(),
            FakeLine { level: true },
            Duration::from_millis(0),
        );
        assert_eq!(adc.readout().await, 0b11_1111_1111);
    }

    #[tokio::test]
    async fn readout_all_low_is_zero() {
        let mut adc = Adc::new(
            FakeLine::default(),
            FakeLine::default(),
            FakeLine { level: false },
            Duration::from_millis(0),
        );
        assert_eq!(adc.readout().await, 0);
    }
}
