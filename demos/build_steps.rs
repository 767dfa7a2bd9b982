use nagare::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn fetch_sources() -> impl Step {
    from_async_fn(|ctx: Context| async move {
        println!("Fetching sources...");
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.data()
            .insert("sources", vec!["main.rs".to_string(), "lib.rs".to_string()]);
        Ok(())
    })
    .named("fetch_sources")
}

fn compile() -> impl Step {
    from_fn(|ctx: Context| {
        let count = ctx
            .data()
            .get::<Vec<String>>("sources")
            .map(Vec::len)
            .unwrap_or_default();
        if count == 0 {
            return ctx.error("nothing to compile");
        }
        if count < 3 {
            ctx.warn(format!("only {} sources found", count));
        }
        ctx.data().insert("artifacts", count);
        ctx.done();
    })
    .named("compile")
}

fn package() -> impl Step {
    from_fn(|ctx: Context| {
        // hand the context to a background task and signal when it is done
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.data().insert("package", "build.tar".to_string());
            ctx.done();
        });
    })
    .named("package")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let build = Arc::new(Pipeline::named("build"));
    build.step(compile()).step(package());

    let release = Arc::new(Pipeline::named("release"));
    release.step(fetch_sources()).step(Arc::clone(&build));

    let mut events = release.subscribe();
    let handle = release.spawn(Data::new());
    let ctx = handle.context();

    match handle.wait().await {
        Ok(()) => println!(
            "Release completed: {:?}",
            ctx.data().get::<String>("package")
        ),
        Err(error) => println!("Release failed: {}", error),
    }

    for event in events.drain() {
        println!("event: {:?}", event);
    }

    Ok(())
}
