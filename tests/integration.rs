#![cfg(feature = "sim")]

#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use gemsched::config::DeductionPolicy;
    use gemsched::hangcheck::HangAction;
    use gemsched::prelude::*;
    use gemsched::seqno::RequestState;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const WAIT: Duration = Duration::from_secs(2);

    fn batch(engine: EngineId, objects: Vec<ExecObject>) -> SubmitArgs {
        SubmitArgs::new(engine, objects, 64)
    }

    #[test]
    fn test_bindings_never_overlap() {
        let (dev, _sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();

        for size in [4 * KIB, 64 * KIB, 12 * KIB, 256 * KIB, 8 * KIB] {
            let data = dev.create_object(client, size).unwrap();
            let bb = dev.create_object(client, 4 * KIB).unwrap();
            let objects = vec![
                ExecObject::new(data).with_flags(ExecObjectFlags::NEEDS_MAPPABLE),
                ExecObject::new(bb),
            ];
            dev.submit(client, &batch(EngineId::Render, objects)).unwrap();
        }
        dev.retire_requests();

        let occupancy = dev.occupancy();
        assert_eq!(occupancy.bindings.len(), 10);
        for pair in occupancy.bindings.windows(2) {
            let (_, offset, size) = pair[0];
            assert!(offset + size <= pair[1].1, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        let mut ids: Vec<_> = occupancy.bindings.iter().map(|b| b.0).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_active_objects_are_not_evicted() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        sim.pause(EngineId::Render);

        let held = dev.create_object(client, MIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        dev.submit(
            client,
            &batch(EngineId::Render, vec![ExecObject::new(held), ExecObject::new(bb)]),
        )
        .unwrap();
        let placed = dev.binding(client, held).unwrap().unwrap();

        let huge = dev.create_object(client, 15 * MIB).unwrap();
        let bb2 = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Blit, vec![ExecObject::new(huge), ExecObject::new(bb2)])
            .with_flags(ExecFlags::NONBLOCK);
        let before = dev.occupancy();
        assert!(matches!(dev.submit(client, &args), Err(GemError::NoSpace)));
        assert_eq!(dev.occupancy(), before);
        assert_eq!(dev.binding(client, held).unwrap().unwrap().offset, placed.offset);
        assert!(dev.busy(client, held).unwrap());

        sim.resume(EngineId::Render);
        dev.wait_rendering(client, held, false, WAIT).unwrap();
        dev.submit(client, &args).unwrap();
        assert!(dev.binding(client, held).unwrap().is_none());
        assert!(dev.stats().evictions >= 1);
    }

    #[test]
    fn test_finished_work_is_retired_before_eviction() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        sim.pause(EngineId::Render);

        let held = dev.create_object(client, MIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let seqno = dev
            .submit(
                client,
                &batch(EngineId::Render, vec![ExecObject::new(held), ExecObject::new(bb)]),
            )
            .unwrap();
        sim.process_until(EngineId::Render, seqno);

        // Done on the hardware, possibly not yet swept by the device.
        let huge = dev.create_object(client, 15 * MIB).unwrap();
        let bb2 = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Blit, vec![ExecObject::new(huge), ExecObject::new(bb2)])
            .with_flags(ExecFlags::NONBLOCK);
        dev.submit(client, &args).unwrap();

        assert!(dev.binding(client, held).unwrap().is_none());
        assert!(dev.binding(client, huge).unwrap().is_some());
        assert_eq!(dev.request_state(EngineId::Render, seqno), RequestState::Retired);
    }

    #[test]
    #[serial]
    fn test_out_of_space_waits_for_running_engine() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        sim.pause(EngineId::Render);

        let held = dev.create_object(client, MIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        dev.submit(
            client,
            &batch(EngineId::Render, vec![ExecObject::new(held), ExecObject::new(bb)]),
        )
        .unwrap();

        let resumer = {
            let sim = Arc::clone(&sim);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                sim.resume(EngineId::Render);
            })
        };
        let huge = dev.create_object(client, 15 * MIB).unwrap();
        let bb2 = dev.create_object(client, 4 * KIB).unwrap();
        dev.submit(
            client,
            &batch(EngineId::Blit, vec![ExecObject::new(huge), ExecObject::new(bb2)]),
        )
        .unwrap();
        resumer.join().unwrap();

        assert!(dev.binding(client, held).unwrap().is_none());
        assert!(!dev.busy(client, held).unwrap());
    }

    #[test]
    fn test_alternating_large_buffers_always_fit() {
        let (dev, _sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Privileged).unwrap();
        let big = [
            dev.create_object(client, 9 * MIB).unwrap(),
            dev.create_object(client, 9 * MIB).unwrap(),
        ];
        let bb = dev.create_object(client, 4 * KIB).unwrap();

        for round in 0..20 {
            let data = big[round % 2];
            let args = batch(EngineId::Render, vec![ExecObject::new(data), ExecObject::new(bb)]);
            if let Err(e) = dev.submit(client, &args) {
                panic!("round {}: {:?}", round, e);
            }
        }
        dev.wait_rendering(client, bb, false, WAIT).unwrap();
        assert!(dev.stats().evictions >= 19);
    }

    #[test]
    fn test_requests_complete_in_order() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        sim.pause(EngineId::Render);

        let seqnos: Vec<u32> = (0..3)
            .map(|_| {
                dev.submit(client, &batch(EngineId::Render, vec![ExecObject::new(bb)]))
                    .unwrap()
            })
            .collect();
        assert_eq!(seqnos, vec![1, 2, 3]);
        assert_eq!(dev.request_state(EngineId::Render, 1), RequestState::Submitted);

        sim.process_until(EngineId::Render, 2);
        dev.retire_requests();
        assert_eq!(dev.completed_seqno(EngineId::Render), 2);
        assert_eq!(dev.request_state(EngineId::Render, 1), RequestState::Retired);
        assert_eq!(dev.request_state(EngineId::Render, 2), RequestState::Retired);
        assert_eq!(dev.request_state(EngineId::Render, 3), RequestState::Submitted);
        assert!(dev.busy(client, bb).unwrap());

        sim.resume(EngineId::Render);
        dev.wait_rendering(client, bb, false, WAIT).unwrap();
        assert_eq!(dev.request_state(EngineId::Render, 3), RequestState::Retired);
    }

    #[test]
    #[serial]
    fn test_completion_charged_budget_throttles_and_refills() {
        let mut config = DeviceConfig::testing();
        config.scheduler.shared_policy = DeductionPolicy::Completion;
        config.scheduler.shared_period_us = 200_000;
        config.scheduler.shared_capacity_us = 35_000;
        config.scheduler.rogue_enabled = false;
        let (dev, sim) = Device::simulated(config).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Render, vec![ExecObject::new(bb)]);
        let nonblocking = args.clone().with_flags(ExecFlags::NONBLOCK);

        sim.pause(EngineId::Render);
        let first = dev.submit(client, &args).unwrap();
        thread::sleep(Duration::from_millis(60));
        sim.process_until(EngineId::Render, first);
        dev.retire_requests();

        assert_eq!(dev.control_snapshot().shared.balance_us, 0);
        assert!(matches!(dev.submit(client, &nonblocking), Err(GemError::WouldBlock)));
        assert!(matches!(dev.submit(client, &nonblocking), Err(GemError::WouldBlock)));
        assert_eq!(dev.control_snapshot().shared.balance_us, 0);

        thread::sleep(Duration::from_millis(200));
        let second = dev.submit(client, &nonblocking).unwrap();
        assert!(second > first);
        let shared = dev.control_snapshot().shared;
        assert!(shared.balance_us > 0 && shared.balance_us <= shared.capacity_us);
    }

    #[test]
    #[serial]
    fn test_blocking_submit_waits_for_refill() {
        let mut config = DeviceConfig::testing();
        config.scheduler.shared_policy = DeductionPolicy::Completion;
        config.scheduler.shared_period_us = 100_000;
        config.scheduler.shared_capacity_us = 10_000;
        config.scheduler.rogue_enabled = false;
        let (dev, sim) = Device::simulated(config).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Render, vec![ExecObject::new(bb)]);

        sim.pause(EngineId::Render);
        let first = dev.submit(client, &args).unwrap();
        thread::sleep(Duration::from_millis(20));
        sim.process_until(EngineId::Render, first);
        dev.retire_requests();
        sim.resume(EngineId::Render);

        let started = std::time::Instant::now();
        dev.submit(client, &args).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wedge_reaches_every_waiter() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let dev = Arc::new(dev);
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        sim.hang(EngineId::Render);
        sim.fail_next_resets(EngineId::Render, 2);
        dev.submit(client, &batch(EngineId::Render, vec![ExecObject::new(bb)]))
            .unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let dev = Arc::clone(&dev);
                thread::spawn(move || dev.wait_rendering(client, bb, false, Duration::from_secs(10)))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        for _ in 0..4 {
            dev.run_hangcheck();
        }

        for waiter in waiters {
            let result = waiter.join().unwrap();
            assert!(
                matches!(result, Err(GemError::Wedged) | Err(GemError::ResetFailed)),
                "{:?}",
                result
            );
        }
        assert!(matches!(dev.wait_for_recovery(WAIT), Err(GemError::ResetFailed)));
        assert!(matches!(
            dev.submit(client, &batch(EngineId::Render, vec![ExecObject::new(bb)])),
            Err(GemError::ResetFailed)
        ));
    }

    #[test]
    #[serial]
    fn test_stopped_ring_recovery_clears_the_stop() {
        let (dev, _sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Render, vec![ExecObject::new(bb)]);

        dev.apply_control(&format!("stop_rings={:#x}", EngineId::Render.mask()))
            .unwrap();
        let stuck = dev.submit(client, &args).unwrap();
        for _ in 0..6 {
            dev.run_hangcheck();
        }
        dev.wait_for_recovery(WAIT).unwrap();
        assert_eq!(dev.control_snapshot().stop_rings, 0);
        assert_eq!(dev.request_state(EngineId::Render, stuck), RequestState::Retired);

        let next = dev.submit(client, &args).unwrap();
        dev.wait_rendering(client, bb, false, WAIT).unwrap();
        assert_eq!(dev.request_state(EngineId::Render, next), RequestState::Retired);
        assert_eq!(dev.completed_seqno(EngineId::Render), next);
    }

    #[test]
    fn test_stalled_engine_recovers() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Render, vec![ExecObject::new(bb)]);
        let generation = dev.reset_generation();

        sim.hang(EngineId::Render);
        let stuck = dev.submit(client, &args).unwrap();
        for _ in 0..4 {
            dev.run_hangcheck();
        }
        dev.wait_for_recovery(WAIT).unwrap();

        assert_ne!(dev.reset_generation(), generation);
        assert_eq!(sim.resets(EngineId::Render), 1);
        assert_eq!(dev.request_state(EngineId::Render, stuck), RequestState::Retired);
        assert!(!dev.busy(client, bb).unwrap());

        let next = dev.submit(client, &args).unwrap();
        assert!(next > stuck);
        dev.wait_rendering(client, bb, false, WAIT).unwrap();
        assert_eq!(dev.request_state(EngineId::Render, next), RequestState::Retired);
    }

    #[test]
    fn test_event_wait_is_kicked() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let fb = dev.create_object(client, 64 * KIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();

        sim.queue_flip(0);
        dev.mark_flip_pending(client, fb, 0).unwrap();
        let seqno = dev
            .submit(
                client,
                &batch(EngineId::Render, vec![ExecObject::new(fb), ExecObject::new(bb)]),
            )
            .unwrap();
        assert_eq!(sim.completed_seqno(EngineId::Render), 0);

        let health = dev.run_hangcheck();
        assert_eq!(health[EngineId::Render.index()].action, HangAction::Kick);
        dev.wait_rendering(client, bb, false, WAIT).unwrap();
        assert_eq!(sim.completed_seqno(EngineId::Render), seqno);
        assert_eq!(dev.reset_generation(), 0);
    }

    #[test]
    fn test_flip_releases_waiting_engine() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Privileged).unwrap();
        let fb = dev.create_object(client, 64 * KIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        dev.pin_for_scanout(client, fb).unwrap();

        sim.queue_flip(0);
        dev.mark_flip_pending(client, fb, 0).unwrap();
        let args = batch(EngineId::Render, vec![ExecObject::new(fb), ExecObject::new(bb)]);
        let seqno = dev.submit(client, &args).unwrap();
        assert_eq!(sim.completed_seqno(EngineId::Render), 0);

        sim.flip_done(0);
        dev.complete_flip(0);
        dev.wait_for_flip_complete(EngineId::Render.mask(), WAIT).unwrap();
        assert_eq!(dev.completed_seqno(EngineId::Render), seqno);
        assert_eq!(dev.object(client, fb).unwrap().pending_flip, 0);

        let next = dev.submit(client, &args).unwrap();
        dev.wait_rendering(client, bb, false, WAIT).unwrap();
        assert_eq!(sim.completed_seqno(EngineId::Render), next);
        dev.unpin_from_scanout(client, fb).unwrap();
    }

    #[test]
    fn test_mappable_contention() {
        let mut config = DeviceConfig::testing();
        config.gtt.mappable_size = MIB;
        let (dev, sim) = Device::simulated(config).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let mappable = |id| {
            batch(
                EngineId::Render,
                vec![ExecObject::new(id).with_flags(ExecObjectFlags::NEEDS_MAPPABLE)],
            )
        };
        let a = dev.create_object(client, 512 * KIB).unwrap();
        let b = dev.create_object(client, 512 * KIB).unwrap();
        let c = dev.create_object(client, 512 * KIB).unwrap();

        sim.pause(EngineId::Render);
        dev.submit(client, &mappable(a)).unwrap();
        dev.submit(client, &mappable(b)).unwrap();

        let before = dev.occupancy();
        let nonblocking = mappable(c).with_flags(ExecFlags::NONBLOCK);
        assert!(matches!(dev.submit(client, &nonblocking), Err(GemError::NoSpace)));
        assert_eq!(dev.occupancy(), before);
        assert!(dev.binding(client, c).unwrap().is_none());

        sim.resume(EngineId::Render);
        dev.wait_rendering(client, b, false, WAIT).unwrap();
        dev.submit(client, &mappable(c)).unwrap();

        assert!(dev.binding(client, a).unwrap().is_none());
        assert!(dev.binding(client, b).unwrap().is_some());
        let placed = dev.binding(client, c).unwrap().unwrap();
        assert!(placed.end() <= MIB);
        assert_eq!(dev.stats().evictions, 1);
    }

    #[test]
    #[serial]
    fn test_failed_submit_leaves_no_trace() {
        let mut config = DeviceConfig::testing();
        config.engines.ring_size = 4096;
        config.waits.ring_space_timeout_ms = 200;
        config.scheduler.shared_period_us = 1_000_000_000;
        config.scheduler.shared_capacity_us = 100_000_000;
        let (dev, sim) = Device::simulated(config).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let args = batch(EngineId::Render, vec![ExecObject::new(bb)]);

        // Give the client a non-zero average so admission charges it.
        sim.pause(EngineId::Render);
        let first = dev.submit(client, &args).unwrap();
        thread::sleep(Duration::from_millis(30));
        sim.process_until(EngineId::Render, first);
        dev.retire_requests();
        assert!(dev.control_snapshot().clients[0].average_exec_us > 0);

        dev.apply_control(&format!("stop_rings={:#x}", EngineId::Render.mask()))
            .unwrap();
        for _ in 0..1000 {
            let balance = dev.control_snapshot().shared.balance_us;
            let occupancy = dev.occupancy();
            match dev.submit(client, &args) {
                Ok(_) => assert!(dev.control_snapshot().shared.balance_us < balance),
                Err(e) => {
                    assert!(matches!(e, GemError::Timeout), "{:?}", e);
                    assert_eq!(dev.control_snapshot().shared.balance_us, balance);
                    assert_eq!(dev.occupancy(), occupancy);
                    return;
                }
            }
        }
        panic!("ring never filled");
    }

    #[test]
    fn test_invalid_relocation_leaves_no_trace() {
        let (dev, _sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let target = dev.create_object(client, 8 * KIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();

        let before = dev.occupancy();
        let bad = ExecObject::new(bb).with_relocation(Relocation::new(target, 4096, Domains::RENDER));
        let err = dev
            .submit(
                client,
                &batch(EngineId::Render, vec![ExecObject::new(target), bad]),
            )
            .unwrap_err();
        assert!(matches!(err, GemError::InvalidArgument(_)), "{:?}", err);
        assert_eq!(dev.occupancy(), before);
        assert_eq!(dev.control_snapshot().clients[0].pending, 0);
    }

    #[test]
    fn test_overflowing_offsets_are_rejected() {
        let (dev, _sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let target = dev.create_object(client, 8 * KIB).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        let before = dev.occupancy();

        let wrapped_batch = batch(EngineId::Render, vec![ExecObject::new(bb)])
            .starting_at(u64::MAX - 7);
        let err = dev.submit(client, &wrapped_batch).unwrap_err();
        assert!(matches!(err, GemError::InvalidArgument(_)), "{:?}", err);

        let wrapped_reloc = ExecObject::new(bb).with_relocation(Relocation::new(
            target,
            u64::MAX - 3,
            Domains::RENDER,
        ));
        let err = dev
            .submit(
                client,
                &batch(EngineId::Render, vec![ExecObject::new(target), wrapped_reloc]),
            )
            .unwrap_err();
        assert!(matches!(err, GemError::InvalidArgument(_)), "{:?}", err);

        assert_eq!(dev.occupancy(), before);
        assert_eq!(dev.control_snapshot().clients[0].pending, 0);
        dev.submit(client, &batch(EngineId::Render, vec![ExecObject::new(bb)]))
            .unwrap();
    }

    #[test]
    fn test_closed_client_frees_objects_after_retire() {
        let (dev, sim) = Device::simulated(DeviceConfig::testing()).unwrap();
        let client = dev.open_client(PriorityClass::Normal).unwrap();
        let bb = dev.create_object(client, 4 * KIB).unwrap();
        sim.pause(EngineId::Render);
        dev.submit(client, &batch(EngineId::Render, vec![ExecObject::new(bb)]))
            .unwrap();

        dev.close_client(client).unwrap();
        assert_eq!(dev.object_count(), 1);
        assert!(matches!(
            dev.busy(client, bb),
            Err(GemError::UnknownClient(_))
        ));

        sim.resume(EngineId::Render);
        dev.retire_requests();
        assert_eq!(dev.object_count(), 0);
        assert!(dev.occupancy().bindings.is_empty());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        let mut config = DeviceConfig::testing();
        config.scheduler.shared_policy = DeductionPolicy::Completion;
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        let loaded = DeviceConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
        let (dev, _sim) = Device::simulated(loaded).unwrap();
        assert_eq!(
            dev.control_snapshot().shared_policy,
            DeductionPolicy::Completion
        );
    }
}
