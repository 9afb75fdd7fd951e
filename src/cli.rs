use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use transq_common::{JobStatus, SubmitRequest};

#[derive(Parser)]
#[command(name = "transq")]
#[command(author, version, about = "Resource-aware video conversion queue")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C, resuming unfinished jobs from the database
    Run,

    /// Convert one file now and wait for the result
    Submit(JobArgs),

    /// Record a pending job for the next `run`
    Enqueue(JobArgs),

    /// Show stored jobs, or a single job
    Status {
        /// Job to show
        id: Option<String>,

        /// Only jobs in this state (pending, running, retrying, completed, failed, cancelled)
        #[arg(long)]
        state: Option<JobStatus>,

        /// Maximum number of jobs to list
        #[arg(long, default_value = "50")]
        limit: u32,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sample host resources and show the admission decision
    Resources {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete finished jobs older than the given number of days
    Prune {
        #[arg(long, default_value = "30")]
        days: u32,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
pub struct JobArgs {
    /// Source video
    pub input: String,

    /// Destination file
    pub output: String,

    /// Job id (a UUID is generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Constant quality factor, 0-51
    #[arg(short, long)]
    pub quality: Option<u32>,

    /// Output frame size, e.g. 1280x720
    #[arg(short, long)]
    pub resolution: Option<String>,

    /// Video bitrate in kbps
    #[arg(long)]
    pub video_bitrate: Option<u32>,

    /// Audio bitrate in kbps
    #[arg(long)]
    pub audio_bitrate: Option<u32>,

    /// Retries after a failed attempt
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl JobArgs {
    pub fn into_request(self) -> SubmitRequest {
        SubmitRequest {
            job_id: self.id,
            input_path: self.input,
            output_path: self.output,
            quality: self.quality,
            resolution: self.resolution,
            video_bitrate: self.video_bitrate,
            audio_bitrate: self.audio_bitrate,
            max_retries: self.max_retries,
        }
    }
}
