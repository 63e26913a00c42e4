// vim: tw=80
use std::io::{self, Write};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    /// Print percent-complete transitions in place on stdout.
    Numeric,
    Quiet,
}

/// Progress accounting for one apply.
///
/// `total_units` is accumulated by the compute-progress phase before any
/// action runs, so the percentage only ever moves forward.
pub struct Progress {
    mode: ProgressMode,
    pub total_units: u64,
    units_done: u64,
    last_percent: Option<u64>,
}

impl Progress {
    pub fn new(mode: ProgressMode) -> Self {
        Progress {
            mode,
            total_units: 0,
            units_done: 0,
            last_percent: None,
        }
    }

    pub fn units_done(&self) -> u64 {
        self.units_done
    }

    pub fn report(&mut self, units: u64) {
        self.units_done += units;
        if self.mode != ProgressMode::Numeric || self.total_units == 0 {
            return;
        }
        let pct =
            self.units_done.min(self.total_units) * 100 / self.total_units;
        if self.last_percent != Some(pct) {
            print!("\r{pct:3}%");
            io::stdout().flush().ok();
            self.last_percent = Some(pct);
        }
    }

    /// The apply completed; pin the display at 100%.
    pub fn finish(&mut self) {
        self.units_done = self.units_done.max(self.total_units);
        if self.mode == ProgressMode::Numeric {
            println!("\r100%");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting() {
        let mut p = Progress::new(ProgressMode::Quiet);
        p.total_units = 100;
        p.report(30);
        p.report(20);
        assert_eq!(p.units_done(), 50);
        p.finish();
        assert_eq!(p.units_done(), 100);
    }
}
