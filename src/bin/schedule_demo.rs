/// Playback scheduling demo
/// Feeds jittered speech chunks into the scheduler on a simulated output and
/// logs where each lands on the device timeline, with one interruption midway.
use anyhow::Result;
use dmon_live::activity::ActivityClock;
use dmon_live::device::{FrequencyAnalyser, OutputDevice};
use dmon_live::pcm::{encode_pcm16, PLAYBACK_SAMPLE_RATE};
use dmon_live::playback::{PlaybackScheduler, SchedulerConfig};
use dmon_live::sim::SimulatedOutput;
use rand::Rng;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHUNKS: usize = 24;
const INTERRUPT_AT: usize = 12;

fn speech_chunk(index: usize, samples: usize) -> Vec<u8> {
    let freq = 180.0 + 15.0 * index as f32;
    let pcm: Vec<f32> = (0..samples)
        .map(|i| 0.4 * (2.0 * PI * freq * i as f32 / PLAYBACK_SAMPLE_RATE as f32).sin())
        .collect();
    encode_pcm16(&pcm)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let output = SimulatedOutput::new(PLAYBACK_SAMPLE_RATE);
    let activity = Arc::new(ActivityClock::new((25_000, 40_000), (20_000, 40_000)));
    let mut scheduler = PlaybackScheduler::new(output.clone(), activity, SchedulerConfig::default());
    let analyser = output.analyser();

    let mut rng = rand::rng();
    for index in 0..CHUNKS {
        let jitter = Duration::from_millis(rng.random_range(10..120));
        tokio::time::sleep(jitter).await;

        if index == INTERRUPT_AT {
            info!("Interrupting at device time {:.3}s", output.current_time());
            scheduler.interrupt();
        }

        let samples = rng.random_range(1_200..4_800);
        scheduler.enqueue(speech_chunk(index, samples));
        info!(
            "chunk {:2}: {:4} samples arrived at {:.3}s, cursor {:?}, live {}",
            index,
            samples,
            output.current_time(),
            scheduler.cursor().map(|c| (c * 1000.0).round() / 1000.0),
            scheduler.live_count()
        );
    }

    while scheduler.is_playing() {
        let bins = analyser.frequency_bins();
        let level = dmon_live::loudness::level(&bins, 60.0);
        info!(
            "playing until {:.3}s, loudness {:.2}",
            scheduler.cursor().unwrap_or_default(),
            level
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    info!("Timeline drained at {:.3}s", output.current_time());
    scheduler.shutdown();
    Ok(())
}
