use uds_domain::config::{ConfigSeverity, EngineConfig, StoreBackend};

use crate::engine::Engine;

/// Runs all diagnostic checks and prints a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one failed.
pub async fn run(config: &EngineConfig, config_path: &str) -> anyhow::Result<bool> {
    println!("uds-engine doctor");
    println!("=================\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);

    match Engine::bootstrap(config, "doctor").await {
        Ok(engine) => {
            check_store(config, &engine, &mut all_passed).await;
            check_providers(&engine, &mut all_passed).await;
        }
        Err(e) => {
            let label = match config.store.backend {
                StoreBackend::Memory => "Memory store reachable",
                StoreBackend::Postgres => "Postgres store reachable",
            };
            print_check(label, false, format!("{e}"));
            print_check("Provider plug-ins reachable", false, "store unavailable, skipped".into());
            all_passed = false;
        }
    }

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &EngineConfig, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
        return;
    }

    print_check(
        "Config validation",
        error_count == 0,
        format!("{} issue(s) ({error_count} error(s))", issues.len()),
    );
    for issue in &issues {
        println!("      {issue}");
    }
    if error_count > 0 {
        *all_passed = false;
    }
}

async fn check_store(config: &EngineConfig, engine: &Engine, all_passed: &mut bool) {
    let label = match config.store.backend {
        StoreBackend::Memory => "Memory store reachable",
        StoreBackend::Postgres => "Postgres store reachable",
    };

    match engine.store.list_pools().await {
        Ok(pools) => print_check(label, true, format!("{} pool(s)", pools.len())),
        Err(e) => {
            print_check(label, false, format!("connected but list_pools failed: {e}"));
            *all_passed = false;
        }
    }
}

async fn check_providers(engine: &Engine, all_passed: &mut bool) {
    let pools = engine.store.list_pools().await.unwrap_or_default();
    if pools.is_empty() {
        print_check("Provider plug-ins reachable", true, "no pools configured yet".into());
        return;
    }

    if engine.providers.is_empty() {
        print_check("Provider plug-ins reachable", false, "no plug-in instances built for any configured pool".into());
        *all_passed = false;
        return;
    }

    let mut unreachable = Vec::new();
    for (id, plugin) in &engine.providers {
        match plugin.is_available().await {
            Ok(true) => {}
            Ok(false) => unreachable.push(format!("{id} (maintenance mode)")),
            Err(e) => unreachable.push(format!("{id} ({e})")),
        }
    }

    let ok = unreachable.is_empty();
    print_check(
        "Provider plug-ins reachable",
        ok,
        if ok {
            format!("{} plug-in(s) available", engine.providers.len())
        } else {
            unreachable.join(", ")
        },
    );
    if !ok {
        *all_passed = false;
    }
}

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
