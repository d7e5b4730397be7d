//! Patch session demo -- publish two releases, patch a local directory, load bundles.
//!
//! Run with:
//!   cargo run --example patch_session -p patchwork-runtime
//!
//! Set `RUST_LOG=patchwork_runtime=info` to see per-file progress.

use anyhow::Context;
use patchwork_runtime::prelude::*;

const CDN: &str = "mem://cdn/patch/demo";

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

fn release(version: u32, login_art: &[u8]) -> Vec<BundleSource> {
    vec![
        BundleSource::new("fonts", b"glyph atlas".to_vec()),
        BundleSource::new("ui_common", b"buttons, panels".to_vec()).with_dependencies(["fonts"]),
        BundleSource::new("ui_login", login_art.to_vec()).with_dependencies(["ui_common"]),
        BundleSource::new(format!("news/v{version}"), format!("patch notes {version}").into_bytes()),
    ]
}

fn serve(transport: &MemoryTransport, version: u32, sources: &[BundleSource]) -> anyhow::Result<()> {
    let mut server = MemoryStorage::new();
    let manifest = publish(&mut server, &PatchConfig::default(), version, sources)?;
    transport.mirror(CDN, &server);
    println!(
        "published v{version}: {} bundles, {} bytes",
        manifest.len(),
        manifest.total_size()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

fn wait<T: Clone + 'static>(
    system: &mut PatchSystem,
    handle: &OperationHandle<T>,
) -> anyhow::Result<T> {
    let ticks = system.run_until_idle(10_000);
    let result = handle.result().context("operation still pending")?;
    let output = result?;
    println!("  ({ticks} ticks)");
    Ok(output)
}

fn patch_to_latest(system: &mut PatchSystem) -> anyhow::Result<()> {
    let check = system.check_patch();
    let plan = wait(system, &check)?;
    if plan.is_up_to_date() {
        println!("up to date at v{}", plan.remote.version);
        return Ok(());
    }
    println!(
        "patching v{:?} -> v{}: {} downloads ({} bytes), {} removals",
        plan.local_version,
        plan.remote.version,
        plan.downloads.len(),
        plan.download_bytes,
        plan.removals.len()
    );
    let patch = system.patch_with_progress(plan, |entry| {
        println!("  wrote {} ({} bytes)", entry.file_name, entry.size);
    });
    let summary = wait(system, &patch)?;
    for name in &summary.removed {
        println!("  removed {name}");
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let patch_dir = tempfile::tempdir()?;
    let config = PatchConfig {
        patch_root: patch_dir.path().to_path_buf(),
        remote_base_url: CDN.to_owned(),
        preload_bundles: vec!["fonts".to_owned()],
        retry_delay_ticks: 2,
        ..Default::default()
    };

    let transport = MemoryTransport::new();
    transport.set_latency(3);
    serve(&transport, 1, &release(1, b"login screen, autumn"))?;

    let mut system = PatchSystem::builder(config)
        .storage(FsStorage::create(patch_dir.path())?)
        .transport(transport.clone())
        .build()?;

    patch_to_latest(&mut system)?;

    let preload = system.preload();
    println!("preloaded {:?}", wait(&mut system, &preload)?);

    let login = system.load_asset("ui_login", "UI_Login.prefab");
    let art = wait(&mut system, &login)?;
    let art = art
        .downcast_ref::<Vec<u8>>()
        .context("raw bundles hold byte vectors")?;
    println!("login art: {:?}", String::from_utf8_lossy(art));

    let optional = system.load_bundle("dlc/winter").without_errors();
    system.run_until_idle(10_000);
    if let Some(error) = optional.error() {
        println!("optional bundle skipped: {error}");
    }

    let unload = system.unload_bundles(false);
    println!("unloaded {:?}", wait(&mut system, &unload)?);

    // A new release replaces the login art and the patch notes.
    serve(&transport, 2, &release(2, b"login screen, winter"))?;
    transport.fail_next(format!("{CDN}/{}", name_to_key("ui_login").as_str()), 1);
    patch_to_latest(&mut system)?;
    patch_to_latest(&mut system)?;

    let login = system.load_asset("ui_login", "ui_login");
    let art = wait(&mut system, &login)?;
    if let Some(bytes) = art.downcast_ref::<Vec<u8>>() {
        println!("login art: {:?}", String::from_utf8_lossy(bytes));
    }

    let released = system.shutdown();
    println!(
        "shut down after {} ticks, released {:?}",
        system.tick_count(),
        released
    );
    Ok(())
}
