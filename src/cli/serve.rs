use super::ServeArgs;
use crate::{config, daemon, errors::Result};

pub async fn execute(args: ServeArgs) -> Result<()> {
    let mut config = config::load()?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    daemon::run(config).await
}
