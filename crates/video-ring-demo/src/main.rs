use std::time::Duration;

use clap::{Parser, Subcommand};
use video_ring_demo::{run_reader, run_writer, wait_for_file, Error, ReaderConfig, WriterConfig};

/// A video ring buffer writer/reader demo.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates the shared region and produces synthetic packets into it.
    Writer {
        /// Path to the backing shared-memory file. Created if absent.
        #[arg(long, env = "VIDEO_RING_FILE", default_value = "video-ring.shm")]
        file: String,
        /// Bytes per packet slot.
        #[arg(long, env = "VIDEO_RING_PACKET_SIZE", default_value_t = 1460)]
        packet_size: u32,
        /// Number of slots in the ring.
        #[arg(long, env = "VIDEO_RING_NUM_BUFFERS", default_value_t = 256)]
        num_buffers: u32,
        /// How many synthetic packets to write before exiting.
        #[arg(long, env = "VIDEO_RING_PACKET_COUNT", default_value_t = 10_000)]
        packet_count: u64,
        /// Seconds to wait for free space before giving up.
        #[arg(long, env = "VIDEO_RING_WAIT_SECS", default_value_t = 2)]
        wait_secs: u64,
    },
    /// Attaches to an existing shared region and consumes packets from it.
    Reader {
        /// Path to the backing shared-memory file. Must already exist.
        #[arg(long, env = "VIDEO_RING_FILE", default_value = "video-ring.shm")]
        file: String,
        /// This reader's id. Defaults to this process's own pid.
        #[arg(long, env = "VIDEO_RING_READER_ID")]
        reader_id: Option<i32>,
        /// Seconds to wait for new data before giving up.
        #[arg(long, env = "VIDEO_RING_WAIT_SECS", default_value_t = 2)]
        wait_secs: u64,
        /// Stop after reading this many packets. Runs forever if omitted.
        #[arg(long, env = "VIDEO_RING_PACKET_COUNT")]
        packet_count: Option<u64>,
    },
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::try_parse()?;
    match args.command {
        Command::Writer {
            file,
            packet_size,
            num_buffers,
            packet_count,
            wait_secs,
        } => run_writer(&WriterConfig {
            file,
            packet_size,
            num_buffers,
            packet_count,
            wait_timeout: Duration::from_secs(wait_secs),
        }),
        Command::Reader {
            file,
            reader_id,
            wait_secs,
            packet_count,
        } => {
            wait_for_file(&file);
            run_reader(&ReaderConfig {
                file,
                reader_id: reader_id.unwrap_or_else(|| std::process::id() as i32),
                wait_timeout: Duration::from_secs(wait_secs),
                packet_count,
            })
        }
    }
}
