//! End-to-end check of the relay on real MPI.
//!
//! Exercises the count exchange, color and depth supersegment exchanges,
//! explicit descriptors, truncation into a small region, and the prefix
//! exchange. Every received byte is checked against the pattern the sender
//! wrote.
//! A custom panic hook calls `std::process::abort()` to prevent MPI hangs.
//!
//! Run with: mpiexec -n 4 ./target/debug/examples/relay_exchange

use vdi_relay::{
    BufferRole, Capacities, Collective, ExchangeDescriptor, MpiComm, MpiRuntime, RelayResources,
    ThreadLevel, TruncationPolicy,
};

/// Supersegments rank `src` sends to rank `dst`.
fn supersegments(src: i32, dst: i32) -> i32 {
    1 + (src * 3 + dst) % 4
}

/// Byte value rank `src` fills the fragment for rank `dst` with.
fn fill(src: i32, dst: i32) -> u8 {
    (src * 16 + dst) as u8
}

fn main() {
    let mut relay = RelayResources::initialize(
        MpiRuntime::new(ThreadLevel::Serialized),
        Capacities::new(16 * 4 * 64, 8 * 4 * 64, 64 * 64),
        TruncationPolicy::Strict,
    )
    .expect("relay init failed");

    // Installed after MPI init: some implementations (e.g. MPICH 4.2.0)
    // misbehave with a hook present during initialization.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let world = MpiComm::world();
    let rank = world.rank();
    let size = world.size();

    assert!(size >= 2, "relay_exchange requires at least 2 processes");
    assert!(size <= 64, "relay_exchange supports at most 64 processes");
    assert!(relay.owns_runtime(), "MPI was expected to be started by the relay");

    // ========================================================================
    // Test 1: count exchange
    // ========================================================================
    let sends: Vec<i32> = (0..size).map(|dst| supersegments(rank, dst)).collect();
    let received = relay
        .distribute_counts(&world, &sends)
        .expect("count exchange failed");
    for (src, &count) in received.iter().enumerate() {
        assert_eq!(
            count,
            supersegments(src as i32, rank),
            "rank {rank}: count from {src}"
        );
    }
    if rank == 0 {
        println!("PASS: distribute_counts");
    }

    // ========================================================================
    // Test 2/3: color and depth supersegments
    // ========================================================================
    for role in [BufferRole::Color, BufferRole::Depth] {
        let Some(bytes_per) = role.bytes_per_supersegment() else {
            unreachable!("color and depth have a supersegment layout");
        };
        let local: Vec<u8> = (0..size)
            .flat_map(|dst| {
                let len = supersegments(rank, dst) as usize * bytes_per;
                std::iter::repeat(fill(rank, dst)).take(len)
            })
            .collect();

        let view = relay
            .distribute_supersegments(&world, role, &local, &sends)
            .expect("supersegment exchange failed");

        let mut offset = 0;
        for src in 0..size {
            let len = supersegments(src, rank) as usize * bytes_per;
            let fragment = &view[offset..offset + len];
            assert!(
                fragment.iter().all(|&b| b == fill(src, rank)),
                "rank {rank}: {role} fragment from {src} is wrong"
            );
            offset += len;
        }
        assert_eq!(offset, view.len(), "rank {rank}: {role} view length");
        if rank == 0 {
            println!("PASS: distribute_supersegments ({role})");
        }
    }

    // ========================================================================
    // Test 4: explicit descriptor, nothing sent to self
    // ========================================================================
    {
        let counts: Vec<i32> = (0..size).map(|peer| if peer == rank { 0 } else { 8 }).collect();
        let local: Vec<u8> = (0..size)
            .flat_map(|dst| std::iter::repeat(fill(rank, dst)).take(counts[dst as usize] as usize))
            .collect();
        let descriptor =
            ExchangeDescriptor::from_counts(counts.clone(), counts).expect("descriptor failed");
        let view = relay
            .distribute_color(&world, &local, &descriptor)
            .expect("color exchange failed");
        assert_eq!(view.len(), 8 * (size as usize - 1));
        if rank == 0 {
            println!("PASS: distribute_color");
        }
    }

    // ========================================================================
    // Test 5: truncation into a region smaller than the receive
    // ========================================================================
    {
        let mut small = RelayResources::initialize(
            MpiRuntime::default(),
            Capacities::new(0, 12, 0),
            TruncationPolicy::Truncate,
        )
        .expect("second relay init failed");
        assert!(!small.owns_runtime());

        let counts = vec![8; size as usize];
        let local = vec![rank as u8; 8 * size as usize];
        let descriptor =
            ExchangeDescriptor::from_counts(counts.clone(), counts).expect("descriptor failed");
        let view = small
            .distribute_depth(&world, &local, &descriptor)
            .expect("truncating exchange failed");
        assert_eq!(&view[..], &[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1]);
        small.release();
        if rank == 0 {
            println!("PASS: truncation");
        }
    }

    // ========================================================================
    // Test 6: prefix
    // ========================================================================
    {
        let local: Vec<u8> = (0..size)
            .flat_map(|dst| [fill(rank, dst); 64])
            .collect();
        let view = relay
            .distribute_prefix(&world, &local)
            .expect("prefix exchange failed");
        for (src, share) in view.chunks(64).enumerate() {
            assert!(
                share.iter().all(|&b| b == fill(src as i32, rank)),
                "rank {rank}: prefix share from {src}"
            );
        }
        if rank == 0 {
            println!("PASS: distribute_prefix");
        }
    }

    relay.release();
    if rank == 0 {
        println!("All relay checks passed");
    }
}
