use anyhow::Result;

fn main() -> Result<()> {
    voicesmith::cli::run()
}
