//! Manages the test veth pair by hand: `nettest up|down|check`.

use nettest::{DEV_PREFIX, IP_PREFIX, command, veth};

fn main() -> anyhow::Result<()> {
    command::init_logging();
    let action = std::env::args().nth(1).unwrap_or_else(|| "check".into());
    match action.as_str() {
        "up" => veth::setup_pair(DEV_PREFIX, IP_PREFIX)?,
        "down" => veth::teardown_pair(DEV_PREFIX)?,
        "check" => match veth::check_pair(DEV_PREFIX) {
            Ok(()) => println!("{DEV_PREFIX}0 is present"),
            Err(e) => println!("{e}"),
        },
        other => anyhow::bail!("unknown action {other:?}; expected up, down or check"),
    }
    Ok(())
}
