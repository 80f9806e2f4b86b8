//! Runtime lifecycle: repolicy, rebinds, barriers, finalisation

use numabind::{Binding, Mapping, Rebind, RuntimeBuilder, Topology};

fn runtime(threads: usize) -> numabind::Runtime {
    RuntimeBuilder::new()
        .topology(Topology::uniform(2, 2, 2))
        .affinity(Mapping::Scatter, Binding::Core)
        .threads(threads)
        .build()
        .expect("runtime init")
}

#[test]
fn repolicy_remaps_workers_and_keeps_counters() {
    let rt = runtime(8);
    rt.bind_thread(0).expect("bind");
    rt.bind_thread(1).expect("bind");
    let scatter_proc = rt.numainfo(1).proc;
    let binds_before = rt.num_binds(0);

    rt.set_affinity_policy(4, Mapping::Compact, Binding::PhysCore).expect("repolicy");
    assert_eq!(rt.online_procs(), 4);
    assert_eq!(rt.current_mapping(), Mapping::Compact);
    assert_eq!(rt.current_binding(), Binding::PhysCore);
    assert_ne!(rt.numainfo(1).proc, scatter_proc);

    rt.bind_thread(0).expect("rebind");
    assert_eq!(rt.num_binds(0), binds_before + 1);
}

#[test]
fn set_num_threads_keeps_the_policy() {
    let rt = runtime(8);
    rt.set_num_threads(2).expect("resize");
    assert_eq!(rt.online_procs(), 2);
    assert_eq!(rt.current_mapping(), Mapping::Scatter);
    assert_eq!(rt.current_binding(), Binding::Core);
}

#[test]
fn thread_count_is_capped_by_online_procs() {
    let rt = runtime(64);
    assert_eq!(rt.online_procs(), 8);
}

#[test]
fn check_and_rebind_is_idempotent_after_bind() {
    let rt = runtime(8);
    assert_eq!(rt.check_and_rebind(2).expect("first"), Rebind::Rebound);
    assert_eq!(rt.check_and_rebind(2).expect("second"), Rebind::Unchanged);
    assert_eq!(rt.num_binds(2), 1);
}

#[test]
fn unbind_leaves_bind_set_intact() {
    let rt = runtime(8);
    rt.bind_thread(3).expect("bind");
    let proc_id = rt.numainfo(3).proc;
    rt.unbind_thread(3).expect("unbind");
    assert!(rt.is_bound(3, proc_id));
}

#[test]
fn policy_names_track_the_mode() {
    let rt = runtime(8);
    assert_eq!(rt.mapping_name(), "scatter");
    assert_eq!(rt.binding_name(), "core");

    let off = RuntimeBuilder::new()
        .topology(Topology::uniform(2, 2, 2))
        .build()
        .expect("runtime init");
    assert_eq!(off.mapping_name(), "disable");
    assert_eq!(off.binding_name(), "disable");
    // With placement off, binds are no-ops.
    off.bind_thread(0).expect("noop bind");
    assert_eq!(off.num_binds(0), 0);
}

#[test]
fn node_barriers_synchronise_each_node() {
    let rt = runtime(8);
    let rounds = 20;
    std::thread::scope(|s| {
        for worker in 0..rt.online_procs() {
            let rt = &rt;
            s.spawn(move || {
                for _ in 0..rounds {
                    rt.node_barrier(worker).expect("barrier");
                }
            });
        }
    });
}

#[test]
fn barrier_storage_lives_in_the_registry() {
    let rt = runtime(8);
    // One pre-touched region per online node.
    assert_eq!(rt.registry().len(), rt.online_nodes());
    assert_eq!(rt.registry().count_untouched(), 0);
}

#[test]
fn all_free_disarms_node_barriers() {
    let rt = runtime(8);
    rt.all_free();
    assert!(rt.registry().is_empty());
    assert!(rt.node_barrier(0).is_err());
    // Repolicy re-arms them.
    rt.set_affinity_policy(8, Mapping::Scatter, Binding::Core).expect("repolicy");
    rt.node_barrier(0).expect("barrier after repolicy");
}

#[test]
fn topology_getters_are_stable() {
    let rt = runtime(8);
    assert_eq!(rt.num_procs(), 8);
    assert_eq!(rt.num_nodes(), 2);
    assert_eq!(rt.num_cores(), 4);
    assert_eq!(rt.num_smts(), 8);
    assert_eq!(rt.max_online_procs(), 8);
    assert!(rt.page_size(0) > 0);
    assert_eq!(rt.align_size(), rt.page_size(0));
    assert_eq!(rt.total_memory_size(), rt.memory_size(0) + rt.memory_size(1));
}

#[test]
fn avoid_htcore_halves_the_pool() {
    let rt = RuntimeBuilder::new()
        .topology(Topology::uniform(2, 2, 2))
        .affinity(Mapping::Scatter, Binding::Core)
        .avoid_htcore(true)
        .build()
        .expect("runtime init");
    assert_eq!(rt.online_procs(), 4);
    for t in 0..rt.online_procs() {
        assert_eq!(rt.cpuinfo(rt.numainfo(t).proc).smt, 0);
    }
}

#[test]
fn proclist_restricts_the_online_set() {
    let rt = RuntimeBuilder::new()
        .topology(Topology::uniform(2, 2, 2))
        .affinity(Mapping::Compact, Binding::Core)
        .proclist("0-3")
        .build()
        .expect("runtime init");
    assert_eq!(rt.max_online_procs(), 4);
    assert_eq!(rt.online_nodes(), 1);
}
