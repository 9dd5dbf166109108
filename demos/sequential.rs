use std::time::{Duration, Instant};

use rand::Rng;
use tinyloop::sleep;

async fn hi(start: Instant, n: u32, secs: u64) -> tinyloop::Result<u64> {
    println!("- - enter hi({n}) at {:.1?}", start.elapsed());
    sleep(Duration::from_secs(secs)).await?;
    println!("- - exit  hi({n}) at {:.1?}", start.elapsed());

    Ok(secs)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let start = Instant::now();

    let total = tinyloop::run(async move {
        println!("main() begin");

        let mut total = 0;
        for n in 1..4 {
            total += hi(start, n, rand::thread_rng().gen_range(1..=3)).await?;
            println!("- main() end hi({n}) at {:.1?}", start.elapsed());
        }

        println!("main() end at {:.1?}", start.elapsed());

        Ok::<_, tinyloop::Error>(total)
    })?;

    println!("done! slept for {total}s in total");

    Ok(())
}
