use join_warden::config::AppConfig;

fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "join-warden.yaml".to_string());
    println!("🧪 Testing policy configuration: {path}");

    let config = AppConfig::from_file(&path)?;
    println!("✅ Config loaded successfully");
    println!("   Data dir: {}", config.service.data_dir);
    println!("   Analysis deadline: {}ms", config.service.analysis_deadline_ms);

    let mut communities: Vec<(&str, _)> = vec![("<default>", &config.default_policy)];
    communities.extend(config.communities.iter().map(|(k, v)| (k.as_str(), v)));

    for (community, policy) in communities {
        println!();
        println!("Community {community}:");
        println!("   Enabled: {}", policy.enabled);
        println!("   Minimum account age: {}d", policy.minimum_account_age_days);
        println!(
            "   Thresholds: medium {} / high {} / critical {}",
            policy.thresholds.medium, policy.thresholds.high, policy.thresholds.critical
        );
        println!("   Max risk score: {}", policy.effective_max_risk_score());
        println!("   Multi-identity threshold: {}", policy.multi_identity_threshold);
        println!("   Actions: {:?}", policy.actions);
        println!(
            "   Admin approval: enabled {}, {} min, default {:?}",
            policy.admin_approval.enabled,
            policy.admin_approval.timeout_minutes,
            policy.admin_approval.default_action
        );
        println!(
            "   Whitelist: {} identities, {} roles",
            policy.whitelist.identity_ids.len(),
            policy.whitelist.role_ids.len()
        );
        match policy.validate(community) {
            Ok(()) => println!("   ✅ valid"),
            Err(e) => println!("   ❌ {e}"),
        }
    }

    Ok(())
}
