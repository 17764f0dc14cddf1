//! Terminal rendering for the client: status lines plus a byte progress bar
//! for the transfer currently in flight.

use crate::logger::Logger;
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

pub struct ProgressLogger {
    current: Mutex<Option<(String, ProgressBar)>>,
    show_bars: bool,
}

impl ProgressLogger {
    pub fn new(show_bars: bool) -> Self {
        Self {
            current: Mutex::new(None),
            show_bars,
        }
    }

    fn print(&self, line: String) {
        match &*self.current.lock() {
            Some((_, bar)) => bar.suspend(|| println!("{}", line)),
            None => println!("{}", line),
        }
    }

    fn new_bar(label: &str, total: u64) -> ProgressBar {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        bar
    }
}

impl Logger for ProgressLogger {
    fn info(&self, msg: &str) {
        self.print(format!("[{}] {}", Local::now().format("%H:%M:%S"), msg));
    }

    fn error(&self, context: &str, msg: &str) {
        self.print(format!(
            "[{}] Error: {}: {}",
            Local::now().format("%H:%M:%S"),
            context,
            msg
        ));
    }

    fn progress(&self, label: &str, done: u64, total: u64) {
        if !self.show_bars {
            return;
        }
        let mut current = self.current.lock();
        let same = matches!(&*current, Some((l, _)) if l == label);
        if !same {
            if let Some((_, old)) = current.take() {
                old.finish_and_clear();
            }
            *current = Some((label.to_string(), Self::new_bar(label, total)));
        }
        if let Some((_, bar)) = &*current {
            bar.set_position(done);
            if done >= total {
                bar.finish_and_clear();
            }
        }
        if done >= total {
            *current = None;
        }
    }
}
