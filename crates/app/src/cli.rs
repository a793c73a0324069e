use clap::Parser;
use vision::RelayCliArgs;

/// Annotate a video source and re-stream it at a fixed rate as MPEG-TS over TCP.
#[derive(Debug, Parser)]
#[command(name = "crowd-filter", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub relay: RelayCliArgs,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_a_typical_invocation() {
        let cli = Cli::try_parse_from([
            "crowd-filter",
            "--source",
            "rtsp://camera/stream",
            "--port",
            "9000",
            "--loop",
            "--conf",
            "0.4",
        ])
        .unwrap();
        assert_eq!(cli.relay.source_flag.as_deref(), Some("rtsp://camera/stream"));
        assert_eq!(cli.relay.port, 9000);
        assert!(cli.relay.looping);
        assert_eq!(cli.relay.confidence, 0.4);
    }
}
