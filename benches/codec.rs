//! Codec and delta throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gridrush::core::vec2::Vec2;
use gridrush::game::state::{Direction, EntityKind, MovingEntity, PlayerState, Snapshot};
use gridrush::network::delta::{apply_delta, compute_delta};
use gridrush::network::protocol::{Envelope, Payload};

/// Fixed seed so every run measures the same boards.
fn fixture_rng() -> StdRng {
    StdRng::seed_from_u64(0x6772_6964)
}

/// Busy match: 8 players and 120 mice scattered over the board.
fn busy_board(rng: &mut StdRng) -> Snapshot {
    let mut s = Snapshot::new(20, 15);
    s.sequence = 1;
    s.started = true;
    for id in 1..=8 {
        s.players.push(PlayerState::new(id, format!("player-{id}")));
    }
    for id in 1..=120u32 {
        let position = Vec2::new(rng.gen_range(0..20) as f32, rng.gen_range(0..15) as f32);
        let direction = Direction::ALL[rng.gen_range(0..Direction::ALL.len())];
        s.strategy.mice.push(MovingEntity::new(id, EntityKind::default(), position, direction, 0.25));
    }
    s
}

/// Moves roughly a third of the mice and bumps one score.
fn advanced(base: &Snapshot, rng: &mut StdRng) -> Snapshot {
    let mut next = base.clone();
    next.sequence += 1;
    for mouse in next.strategy.mice.iter_mut() {
        if rng.gen_bool(1.0 / 3.0) {
            mouse.position = mouse.position + mouse.velocity();
        }
    }
    next.players[2].score += 1;
    next
}

fn bench_codec(c: &mut Criterion) {
    let base = busy_board(&mut fixture_rng());
    let frame = Envelope::new(1, 0, Payload::Snapshot(base.clone())).to_bytes();

    c.bench_function("snapshot_encode", |b| {
        b.iter(|| Envelope::new(1, 0, Payload::Snapshot(black_box(base.clone()))).to_bytes())
    });
    c.bench_function("snapshot_decode", |b| b.iter(|| Envelope::from_bytes(black_box(&frame))));
}

fn bench_delta(c: &mut Criterion) {
    let mut rng = fixture_rng();
    let base = busy_board(&mut rng);
    let next = advanced(&base, &mut rng);
    let delta = compute_delta(&base, &next);

    c.bench_function("delta_compute", |b| b.iter(|| compute_delta(black_box(&base), black_box(&next))));
    c.bench_function("delta_apply", |b| b.iter(|| apply_delta(black_box(&base), black_box(&delta))));
}

criterion_group!(benches, bench_codec, bench_delta);
criterion_main!(benches);
