//! Operator command surface: one token per line.

use std::io::BufRead;

use tracing::info;

use crate::capture::CaptureSource;
use crate::error::CaptureError;
use crate::pipeline::runner::CapturePipeline;
use crate::sink::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `start`: write frames continuously.
    Start,
    /// `stop`: stop writing.
    Stop,
    /// `<n>`: write exactly n frames, then stop on its own.
    WriteCount(u32),
    /// `fps`: toggle the capture rate, restarting the pipeline.
    SwitchRate,
    /// `q`: shut everything down.
    Quit,
}

impl Command {
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        match token {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "fps" => Some(Self::SwitchRate),
            "q" => Some(Self::Quit),
            _ if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) => {
                token.parse().ok().map(Self::WriteCount)
            }
            _ => None,
        }
    }
}

/// Reads operator commands and drives the pipeline. Runs on the control
/// thread; commands are handled one at a time, in order.
pub struct CommandController<S: CaptureSource, K: FrameSink + 'static> {
    pipeline: CapturePipeline<S, K>,
}

impl<S: CaptureSource, K: FrameSink + 'static> CommandController<S, K> {
    pub fn new(pipeline: CapturePipeline<S, K>) -> Self {
        Self { pipeline }
    }

    /// Process commands until `q` or end of input, then shut the pipeline
    /// down. Malformed commands are reported and ignored; device failures
    /// during a rate switch propagate.
    pub fn run(mut self, input: impl BufRead) -> Result<(), CaptureError> {
        for line in input.lines() {
            let Ok(line) = line else { break };
            let token = line.trim();
            if token.is_empty() {
                continue;
            }

            match Command::parse(token) {
                Some(Command::Quit) => {
                    info!("quitting...");
                    break;
                }
                Some(command) => self.apply(command)?,
                None => info!("command not valid: '{token}'"),
            }
            info!("write status: {}", self.pipeline.control().status());
        }

        self.pipeline.shutdown()
    }

    fn apply(&mut self, command: Command) -> Result<(), CaptureError> {
        match command {
            Command::Start => {
                if self.pipeline.control().begin_continuous() {
                    info!("writing frames...");
                } else {
                    info!("already writing!");
                }
            }
            Command::Stop => {
                if self.pipeline.control().stop_writing() {
                    info!("write stopped!");
                } else {
                    info!("enter 'start' to commence writing");
                }
            }
            Command::WriteCount(count) => {
                if self.pipeline.control().begin_fixed(count) {
                    info!("writing {count} frames");
                } else {
                    info!("already writing!");
                }
            }
            Command::SwitchRate => self.pipeline.switch_rate()?,
            Command::Quit => unreachable!("quit is handled by the read loop"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tokens() {
        assert_eq!(Command::parse("start"), Some(Command::Start));
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("fps"), Some(Command::SwitchRate));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
        assert_eq!(Command::parse(" start "), Some(Command::Start));
    }

    #[test]
    fn parses_digit_runs_as_frame_counts() {
        assert_eq!(Command::parse("5"), Some(Command::WriteCount(5)));
        assert_eq!(Command::parse("007"), Some(Command::WriteCount(7)));
        assert_eq!(Command::parse("0"), Some(Command::WriteCount(0)));
    }

    #[test]
    fn rejects_everything_else() {
        assert_eq!(Command::parse("quit"), None);
        assert_eq!(Command::parse("+5"), None);
        assert_eq!(Command::parse("-5"), None);
        assert_eq!(Command::parse("5x"), None);
        assert_eq!(Command::parse("FPS"), None);
        assert_eq!(Command::parse(""), None);
        // Larger than u32: rejected rather than wrapped.
        assert_eq!(Command::parse("99999999999999999999"), None);
    }
}
