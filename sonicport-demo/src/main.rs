mod cli;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let has = |flag: &str| args.iter().skip(1).any(|arg| arg == flag);

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mock = has("--mock");
    if has("--list") {
        cli::list_devices(mock)?;
    }
    if has("--beep") || !has("--list") {
        cli::play_beep(mock)?;
    }
    Ok(())
}
