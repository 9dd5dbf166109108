use std::time::{Duration, Instant};

use clap::Parser;
use rand::Rng;
use tinyloop::{create_task, sleep};

#[derive(Parser, Debug)]
#[command(version, about = "Run several sleeping tasks concurrently", long_about = None)]
struct Args {
    /// Number of tasks to start.
    #[arg(short, long, default_value_t = 4)]
    tasks: u32,

    /// Longest sleep, in seconds.
    #[arg(short, long, default_value_t = 3)]
    max_secs: u64,
}

async fn hi(start: Instant, n: u32, secs: u64) -> tinyloop::Result<String> {
    println!("enter hi({n}, {secs}) at {:.1?}", start.elapsed());
    sleep(Duration::from_secs(secs)).await?;
    println!("exit  hi({n}, {secs}) at {:.1?}", start.elapsed());

    Ok(format!("{n}-{secs}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let start = Instant::now();

    tinyloop::run(async move {
        println!("main() begin at {:.1?}", start.elapsed());

        let mut rng = rand::thread_rng();
        let tasks: Vec<_> = (1..=args.tasks)
            .map(|n| create_task(hi(start, n, rng.gen_range(1..=args.max_secs.max(1)))))
            .collect();

        for task in tasks {
            println!("main await at {:.1?}", start.elapsed());
            let b = task.await?;
            println!("b is: {b}");
        }

        println!("main() end at {:.1?}", start.elapsed());

        Ok::<_, tinyloop::Error>(())
    })?;

    Ok(())
}
