use core_types::GameStateSnapshot;

pub const FEATURE_DIM: usize = 8;

const DANGEROUS_STATUSES: [&str; 6] = ["Stunned", "Frozen", "Stone Curse", "Sleep", "Blind", "Silence"];

/// Fixed-width feature vector fed to every policy model. All entries are in [0, 1].
pub fn extract(snapshot: &GameStateSnapshot) -> [f32; FEATURE_DIM] {
    let monsters = snapshot.monsters().count();
    let nearest = snapshot
        .monsters()
        .map(|m| m.distance)
        .min()
        .map(|d| (d.min(20) as f32) / 20.0)
        .unwrap_or(1.0);
    let dangerous = DANGEROUS_STATUSES.iter().any(|s| snapshot.has_status(s));

    [
        snapshot.hp_ratio().unwrap_or(1.0).clamp(0.0, 1.0) as f32,
        snapshot.sp_ratio().unwrap_or(1.0).clamp(0.0, 1.0) as f32,
        snapshot.weight_ratio().unwrap_or(0.0).clamp(0.0, 1.0) as f32,
        (monsters.min(10) as f32) / 10.0,
        (snapshot.aggressive_within(5).min(5) as f32) / 5.0,
        nearest,
        if dangerous { 1.0 } else { 0.0 },
        (snapshot.stats.level.min(100) as f32) / 100.0,
    ]
}
