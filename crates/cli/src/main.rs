use anyhow::Result;

fn main() -> Result<()> {
    ember_cli::run()
}
