//! Scheduler scenarios: fairness of the round-robin claim protocol with
//! two CPUs driving two spinning environments.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cinnabar_kernel::sched::SchedDecision;

use common::*;

#[test]
fn two_cpus_share_two_environments_fairly() {
    const TICKS: usize = 400;

    let k = machine(0x200, 16);
    k.cpus.mark_started(0);
    k.cpus.mark_started(1);
    let env_a = running_user_env(k, 0);
    let env_b = running_user_env(k, 1);

    let counts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let halts = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = [0usize, 1usize]
        .into_iter()
        .map(|cpu| {
            let counts = Arc::clone(&counts);
            let halts = Arc::clone(&halts);
            std::thread::spawn(move || {
                for _ in 0..TICKS {
                    match k.yield_cpu(cpu) {
                        SchedDecision::Run(slot) => {
                            let idx = usize::from(slot == env_b);
                            assert!(slot == env_a || slot == env_b, "unknown claim {slot}");
                            counts[idx].fetch_add(1, Ordering::Relaxed);
                            // The claimed environment must be ours alone.
                            assert_eq!(k.cpus.current_env(cpu), Some(slot));
                        }
                        SchedDecision::Halt => {
                            halts.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("scheduler thread panicked");
    }

    let a = counts[0].load(Ordering::Relaxed);
    let b = counts[1].load(Ordering::Relaxed);
    let idle = halts.load(Ordering::Relaxed);
    assert!(
        a >= TICKS / 3,
        "environment a starved: {a} of {} selections ({idle} idle ticks)",
        2 * TICKS
    );
    assert!(
        b >= TICKS / 3,
        "environment b starved: {b} of {} selections ({idle} idle ticks)",
        2 * TICKS
    );
}

#[test]
fn no_environment_runs_on_two_cpus_at_once() {
    const TICKS: usize = 2000;

    let k = machine(0x200, 16);
    let env = running_user_env(k, 0);
    // Release it so both CPUs start from a clean claim race.
    k.cpus.set_current(0, None);
    assert!(k
        .envs
        .get(env)
        .status
        .transition(
            cinnabar_kernel::env::EnvStatus::Running,
            cinnabar_kernel::env::EnvStatus::Runnable
        ));

    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = [0usize, 1usize]
        .into_iter()
        .map(|cpu| {
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            std::thread::spawn(move || {
                for _ in 0..TICKS {
                    match k.yield_cpu(cpu) {
                        SchedDecision::Run(slot) => {
                            assert_eq!(slot, env);
                            let n = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            max_holders.fetch_max(n, Ordering::SeqCst);
                            holders.fetch_sub(1, Ordering::SeqCst);
                        }
                        SchedDecision::Halt => {}
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("claim thread panicked");
    }
    assert_eq!(
        max_holders.load(Ordering::SeqCst),
        1,
        "the status CAS must keep claims exclusive"
    );
}
