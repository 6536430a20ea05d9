//! Forwarding counters and the once a second rate reporter
//!
//! Only the forwarding path writes the counters and only the reporter reads them, both with
//! relaxed ordering. Nothing ever resets them.

use crossbeam::channel::{bounded, select, tick, Receiver, Sender};
use std::{
	fmt, io,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

#[derive(Debug, Default)]
pub struct Counters {
	bytes: AtomicU64,
	frames: AtomicU64,
	dropped: AtomicU64,
}

impl Counters {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	#[inline]
	pub fn add(&self, bytes: u64, frames: u64) {
		self.bytes.fetch_add(bytes, Ordering::Relaxed);
		self.frames.fetch_add(frames, Ordering::Relaxed);
	}

	/// Frames that were received but never reached the peer's Transmit ring
	#[inline]
	pub fn add_dropped(&self, frames: u64) {
		self.dropped.fetch_add(frames, Ordering::Relaxed);
	}

	pub fn sample(&self) -> Sample {
		Sample {
			bytes: self.bytes.load(Ordering::Relaxed),
			frames: self.frames.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
			at: Instant::now(),
		}
	}
}

/// A snapshot of the counters
#[derive(Clone, Copy, Debug)]
pub struct Sample {
	pub bytes: u64,
	pub frames: u64,
	pub dropped: u64,
	pub at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rate {
	pub pps: u64,
	pub bps: u64,
	pub dropped: u64,
}

impl Rate {
	pub fn between(prev: &Sample, cur: &Sample) -> Self {
		Self::over(prev, cur, cur.at.saturating_duration_since(prev.at))
	}

	/// The rate between two samples taken `elapsed` apart
	pub fn over(prev: &Sample, cur: &Sample, elapsed: Duration) -> Self {
		let secs = elapsed.as_secs_f64();
		let per_sec = |delta: u64| {
			if secs > 0.0 {
				(delta as f64 / secs).round() as u64
			} else {
				0
			}
		};
		Self {
			pps: per_sec(cur.frames.wrapping_sub(prev.frames)),
			bps: per_sec(cur.bytes.wrapping_sub(prev.bytes).saturating_mul(8)),
			dropped: cur.dropped.wrapping_sub(prev.dropped),
		}
	}

	#[inline]
	pub fn mbps(&self) -> u64 {
		self.bps / 1_000_000
	}
}

impl fmt::Display for Rate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:9} pps / {:6} Mbps", self.pps, self.mbps())?;
		if self.dropped > 0 {
			write!(f, " ({} dropped)", self.dropped)?;
		}
		Ok(())
	}
}

/// A background thread logging the forwarding rate every `interval` until stopped
pub struct StatsReporter {
	stop: Option<Sender<()>>,
	thread: Option<JoinHandle<()>>,
}

impl StatsReporter {
	pub fn spawn(counters: Arc<Counters>, interval: Duration) -> io::Result<Self> {
		let (stop, stopped) = bounded::<()>(0);
		let thread = thread::Builder::new()
			.name("stats".into())
			.spawn(move || report(counters, tick(interval), stopped, |rate| log::info!("{}", rate)))?;
		Ok(Self {
			stop: Some(stop),
			thread: Some(thread),
		})
	}

	/// Stops the reporter and waits for its thread
	pub fn stop(&mut self) {
		// dropping the sender disconnects the channel the thread selects on
		self.stop.take();
		if let Some(thread) = self.thread.take() {
			if thread.join().is_err() {
				log::error!("stats reporter panicked");
			}
		}
	}
}

impl Drop for StatsReporter {
	fn drop(&mut self) {
		self.stop();
	}
}

/// Hands `emit` the rate since the previous tick on every tick until `stopped` disconnects
fn report<F>(counters: Arc<Counters>, ticker: Receiver<Instant>, stopped: Receiver<()>, mut emit: F)
where
	F: FnMut(Rate),
{
	let mut prev = counters.sample();
	loop {
		select! {
			recv(ticker) -> _ => {
				let cur = counters.sample();
				emit(Rate::between(&prev, &cur));
				prev = cur;
			}
			recv(stopped) -> _ => break,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(frames: u64, bytes: u64, at: Instant) -> Sample {
		Sample {
			bytes,
			frames,
			dropped: 0,
			at,
		}
	}

	#[test]
	fn steady_traffic_gives_its_rate() {
		let t0 = Instant::now();
		let (r, s) = (1_000_000u64, 64u64);
		let prev = sample(5 * r, 5 * r * s, t0);
		let cur = sample(6 * r, 6 * r * s, t0 + Duration::from_secs(1));
		let rate = Rate::between(&prev, &cur);
		assert_eq!(rate.pps, r);
		assert_eq!(rate.bps, r * s * 8);
		assert_eq!(rate.mbps(), 512);
	}

	#[test]
	fn rate_is_scaled_by_elapsed_time() {
		let t0 = Instant::now();
		let prev = sample(0, 0, t0);
		let cur = sample(3000, 3000 * 100, t0);
		let rate = Rate::over(&prev, &cur, Duration::from_millis(1500));
		assert_eq!(rate.pps, 2000);
		assert_eq!(rate.bps, 2000 * 100 * 8);
		assert_eq!(Rate::over(&prev, &cur, Duration::ZERO).pps, 0);
	}

	#[test]
	fn display_matches_log_format() {
		let rate = Rate {
			pps: 1234,
			bps: 15_000_000,
			dropped: 0,
		};
		assert_eq!(rate.to_string(), "     1234 pps /     15 Mbps");
		let rate = Rate { dropped: 3, ..rate };
		assert!(rate.to_string().ends_with("(3 dropped)"));
	}

	#[test]
	fn counters_accumulate() {
		let c = Counters::new();
		c.add(64, 1);
		c.add(128, 2);
		c.add_dropped(4);
		let s = c.sample();
		assert_eq!((s.bytes, s.frames, s.dropped), (192, 3, 4));
	}

	#[test]
	fn reporter_logs_a_line_per_tick() {
		let counters = Counters::new();
		let (stop, stopped) = bounded::<()>(0);
		let (lines, logged) = crossbeam::channel::unbounded();
		let reporter = {
			let counters = counters.clone();
			thread::spawn(move || {
				report(counters, tick(Duration::from_millis(10)), stopped, |rate| {
					let _ = lines.send(rate.to_string());
				})
			})
		};

		let mut busy = None;
		while busy.is_none() {
			counters.add(64 * 1000, 1000);
			let line = logged.recv_timeout(Duration::from_secs(5)).unwrap();
			let pps: u64 = line.split_whitespace().next().unwrap().parse().unwrap();
			if pps > 0 {
				busy = Some(line);
			}
		}
		let line = busy.unwrap();
		assert!(line.contains(" pps / "));
		assert!(line.ends_with(" Mbps"));

		drop(stop);
		reporter.join().unwrap();
	}

	#[test]
	fn reporter_stops_promptly() {
		let mut reporter = StatsReporter::spawn(Counters::new(), Duration::from_secs(3600)).unwrap();
		let started = Instant::now();
		reporter.stop();
		assert!(started.elapsed() < Duration::from_secs(5));
	}
}
