// SPDX-License-Identifier: CEPL-1.0
//! Frame slots and the per-tick acquire -> record -> submit -> present cycle.
//!
//! `FrameScheduler` owns only the decisions (which slot, when to abort, when to recreate).
//! The GPU side lives behind `FrameBackend`, implemented by the renderer.

use anyhow::{Context, Result};
use ash::vk;
use bitflags::bitflags;
use tracing::{debug, trace};

/// Upper bound on frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

bitflags! {
    /// Why the swapchain is being rebuilt.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RecreateReasons: u8 {
        const OUT_OF_DATE = 1 << 0;
        const SUBOPTIMAL = 1 << 1;
        const RESIZED = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame reached present. `recreated` lists every rebuild this tick triggered.
    Presented {
        slot: usize,
        image_index: u32,
        recreated: RecreateReasons,
    },
    /// Acquire found the chain stale; nothing was submitted and the slot did not advance.
    Skipped { slot: usize, recreated: RecreateReasons },
}

/// GPU operations the scheduler sequences, called in declaration order within a tick.
pub trait FrameBackend {
    /// Returns and clears the external resize flag.
    fn take_resized(&mut self) -> bool;
    /// Blocks until the slot's last submission has finished.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome>;
    /// Unsignals the slot's fence. Only called once the tick is certain to submit.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn write_uniforms(&mut self, slot: usize) -> Result<()>;
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    fn recreate(&mut self, reasons: RecreateReasons) -> Result<()>;
}

#[derive(Debug)]
pub struct FrameScheduler {
    slot_count: usize,
    current: usize,
    frames: u64,
}

impl FrameScheduler {
    /// `slot_count` is clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count: slot_count.clamp(1, MAX_FRAMES_IN_FLIGHT),
            current: 0,
            frames: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Frames that reached present.
    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    pub fn tick<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<TickOutcome> {
        let slot = self.current;
        let mut recreated = RecreateReasons::empty();

        // nothing is acquired yet, so this is a safe point to apply a resize
        if backend.take_resized() {
            backend.recreate(RecreateReasons::RESIZED)?;
            recreated |= RecreateReasons::RESIZED;
        }

        backend.wait_for_slot(slot)?;
        let (image_index, acquire_suboptimal) = match backend.acquire(slot)? {
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                debug!("acquire out of date on slot {slot}");
                backend.recreate(RecreateReasons::OUT_OF_DATE)?;
                recreated |= RecreateReasons::OUT_OF_DATE;
                return Ok(TickOutcome::Skipped { slot, recreated });
            }
        };

        let mut pending = match Self::run_acquired(backend, slot, image_index)? {
            PresentOutcome::Presented => RecreateReasons::empty(),
            PresentOutcome::Suboptimal => RecreateReasons::SUBOPTIMAL,
            PresentOutcome::OutOfDate => RecreateReasons::OUT_OF_DATE,
        };
        if acquire_suboptimal {
            pending |= RecreateReasons::SUBOPTIMAL;
        }
        if backend.take_resized() {
            pending |= RecreateReasons::RESIZED;
        }

        self.frames += 1;
        self.current = (self.current + 1) % self.slot_count;

        if !pending.is_empty() {
            debug!(?pending, "recreating after present");
            backend.recreate(pending)?;
            recreated |= pending;
        }
        trace!(slot, image_index, "frame presented");
        Ok(TickOutcome::Presented {
            slot,
            image_index,
            recreated,
        })
    }

    /// Reset, record, write uniforms, submit, present. Any error leaves the slot unadvanced.
    fn run_acquired<B: FrameBackend + ?Sized>(
        backend: &mut B,
        slot: usize,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        backend.reset_slot(slot)?;
        backend.record(slot, image_index)?;
        backend.write_uniforms(slot)?;
        backend.submit(slot)?;
        backend.present(slot, image_index)
    }
}

/// Per-slot synchronization objects and the command buffer recorded each time the slot comes round.
#[derive(Debug)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub cmd: vk::CommandBuffer,
}

impl FrameSlot {
    /// Command buffers go back with their pool; only the sync objects are destroyed here.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Fences start signaled so each slot's first wait returns immediately.
pub unsafe fn create_frame_slots(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: usize,
) -> Result<Vec<FrameSlot>> {
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: count as u32,
        ..Default::default()
    };
    let cmds = device
        .allocate_command_buffers(&ai)
        .context("allocate_command_buffers(frames)")?;

    let sem_ci = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    let fence_ci = vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    };

    let mut slots = Vec::with_capacity(count);
    for cmd in cmds {
        slots.push(FrameSlot {
            image_available: device
                .create_semaphore(&sem_ci, None)
                .context("create_semaphore(image_available)")?,
            render_finished: device
                .create_semaphore(&sem_ci, None)
                .context("create_semaphore(render_finished)")?,
            in_flight: device.create_fence(&fence_ci, None).context("create_fence")?,
            cmd,
        });
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Fence {
        Signaled,
        Reset,
        InFlight,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Uniforms(usize),
        Submit(usize),
        Present(usize, u32),
        Recreate(RecreateReasons),
    }

    /// Models fences and the swapchain closely enough to catch ordering mistakes.
    struct MockBackend {
        fences: Vec<Fence>,
        calls: Vec<Call>,
        acquires: VecDeque<Result<AcquireOutcome, &'static str>>,
        presents: VecDeque<PresentOutcome>,
        resize_flags: VecDeque<bool>,
        next_image: u32,
        image_count: u32,
    }

    impl MockBackend {
        fn new(slots: usize) -> Self {
            Self {
                fences: vec![Fence::Signaled; slots],
                calls: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                resize_flags: VecDeque::new(),
                next_image: 0,
                image_count: 3,
            }
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }

        fn recorded_slots(&self) -> Vec<usize> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Record(s, _) => Some(*s),
                    _ => None,
                })
                .collect()
        }

        fn recreates(&self) -> Vec<RecreateReasons> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Recreate(r) => Some(*r),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameBackend for MockBackend {
        fn take_resized(&mut self) -> bool {
            self.resize_flags.pop_front().unwrap_or(false)
        }

        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            match self.fences[slot] {
                Fence::Reset => Err(anyhow!("waiting on reset fence {slot} would never return")),
                _ => {
                    self.fences[slot] = Fence::Signaled;
                    Ok(())
                }
            }
        }

        fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            match self.acquires.pop_front() {
                Some(Ok(o)) => Ok(o),
                Some(Err(e)) => Err(anyhow!(e)),
                None => {
                    let image_index = self.next_image;
                    self.next_image = (self.next_image + 1) % self.image_count;
                    Ok(AcquireOutcome::Ready {
                        image_index,
                        suboptimal: false,
                    })
                }
            }
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            assert_eq!(self.fences[slot], Fence::Signaled, "reset before wait on slot {slot}");
            self.fences[slot] = Fence::Reset;
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Record(slot, image_index));
            assert_eq!(self.fences[slot], Fence::Reset, "slot {slot} recorded while in flight");
            Ok(())
        }

        fn write_uniforms(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Uniforms(slot));
            assert_eq!(self.fences[slot], Fence::Reset, "uniforms of slot {slot} written while in flight");
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            self.fences[slot] = Fence::InFlight;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn recreate(&mut self, reasons: RecreateReasons) -> Result<()> {
            self.calls.push(Call::Recreate(reasons));
            self.next_image = 0;
            Ok(())
        }
    }

    fn run(sched: &mut FrameScheduler, backend: &mut MockBackend, ticks: usize) -> Vec<TickOutcome> {
        (0..ticks).map(|_| sched.tick(backend).unwrap()).collect()
    }

    #[test]
    fn slot_count_is_clamped() {
        assert_eq!(FrameScheduler::new(0).slot_count(), 1);
        assert_eq!(FrameScheduler::new(2).slot_count(), 2);
        assert_eq!(FrameScheduler::new(16).slot_count(), MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn slots_rotate_without_skips() {
        let mut sched = FrameScheduler::new(3);
        let mut be = MockBackend::new(3);
        run(&mut sched, &mut be, 7);
        assert_eq!(be.recorded_slots(), vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(sched.current_slot(), 1);
        assert_eq!(sched.frames_presented(), 7);
    }

    #[test]
    fn one_fence_wait_per_tick() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        run(&mut sched, &mut be, 10);
        assert_eq!(be.count(|c| matches!(c, Call::Wait(_))), 10);
        assert_eq!(be.count(|c| matches!(c, Call::Submit(_))), 10);
    }

    #[test]
    fn each_tick_follows_the_fixed_order() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        run(&mut sched, &mut be, 1);
        assert_eq!(
            be.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Uniforms(0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
    }

    #[test]
    fn out_of_date_acquire_skips_the_tick_and_repeats_the_slot() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        run(&mut sched, &mut be, 1);
        be.acquires.push_back(Ok(AcquireOutcome::OutOfDate));

        let out = sched.tick(&mut be).unwrap();
        assert_eq!(
            out,
            TickOutcome::Skipped {
                slot: 1,
                recreated: RecreateReasons::OUT_OF_DATE
            }
        );
        // fence untouched, so the retry's wait returns
        assert_eq!(be.fences[1], Fence::Signaled);
        assert_eq!(sched.current_slot(), 1);

        run(&mut sched, &mut be, 2);
        assert_eq!(be.recorded_slots(), vec![0, 1, 0]);
        assert_eq!(be.recreates(), vec![RecreateReasons::OUT_OF_DATE]);
        assert_eq!(sched.frames_presented(), 3);
    }

    #[test]
    fn suboptimal_acquire_presents_then_recreates() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        be.acquires.push_back(Ok(AcquireOutcome::Ready {
            image_index: 2,
            suboptimal: true,
        }));
        let out = sched.tick(&mut be).unwrap();
        assert_eq!(
            out,
            TickOutcome::Presented {
                slot: 0,
                image_index: 2,
                recreated: RecreateReasons::SUBOPTIMAL
            }
        );
        let present_at = be.calls.iter().position(|c| *c == Call::Present(0, 2)).unwrap();
        let recreate_at = be.calls.iter().position(|c| matches!(c, Call::Recreate(_))).unwrap();
        assert!(present_at < recreate_at);
        assert_eq!(sched.current_slot(), 1);
    }

    #[test]
    fn stale_present_recreates_and_still_advances() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        be.presents.push_back(PresentOutcome::OutOfDate);
        be.presents.push_back(PresentOutcome::Suboptimal);
        run(&mut sched, &mut be, 3);
        assert_eq!(
            be.recreates(),
            vec![RecreateReasons::OUT_OF_DATE, RecreateReasons::SUBOPTIMAL]
        );
        assert_eq!(be.recorded_slots(), vec![0, 1, 0]);
    }

    #[test]
    fn resize_flag_is_honoured_before_acquire_and_after_present() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        // tick start: set; after present: clear; next tick start: clear; after present: set
        be.resize_flags.extend([true, false, false, true]);
        run(&mut sched, &mut be, 2);

        let first_recreate = be.calls.iter().position(|c| matches!(c, Call::Recreate(_))).unwrap();
        let first_acquire = be.calls.iter().position(|c| matches!(c, Call::Acquire(_))).unwrap();
        assert!(first_recreate < first_acquire);
        assert_eq!(be.recreates(), vec![RecreateReasons::RESIZED, RecreateReasons::RESIZED]);
        assert_eq!(be.calls.last(), Some(&Call::Recreate(RecreateReasons::RESIZED)));
    }

    #[test]
    fn reasons_are_merged_into_one_recreate() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        be.acquires.push_back(Ok(AcquireOutcome::Ready {
            image_index: 0,
            suboptimal: true,
        }));
        be.presents.push_back(PresentOutcome::OutOfDate);
        be.resize_flags.extend([false, true]);
        let out = sched.tick(&mut be).unwrap();
        let all = RecreateReasons::OUT_OF_DATE | RecreateReasons::SUBOPTIMAL | RecreateReasons::RESIZED;
        assert_eq!(be.recreates(), vec![all]);
        assert!(matches!(out, TickOutcome::Presented { recreated, .. } if recreated == all));
    }

    #[test]
    fn resize_storm_recreates_once_per_check_and_keeps_rotating() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        be.resize_flags.extend([true; 12]);
        run(&mut sched, &mut be, 6);
        assert_eq!(be.recreates(), vec![RecreateReasons::RESIZED; 12]);
        assert_eq!(be.recorded_slots(), vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(sched.frames_presented(), 6);
    }

    #[test]
    fn acquire_error_is_fatal_and_does_not_advance() {
        let mut sched = FrameScheduler::new(2);
        let mut be = MockBackend::new(2);
        be.acquires.push_back(Err("device lost"));
        assert!(sched.tick(&mut be).is_err());
        assert_eq!(sched.current_slot(), 0);
        assert_eq!(sched.frames_presented(), 0);
        assert_eq!(be.count(|c| matches!(c, Call::Submit(_))), 0);
        assert_eq!(be.fences[0], Fence::Signaled);
    }

    #[test]
    fn single_slot_waits_on_its_own_previous_frame() {
        let mut sched = FrameScheduler::new(1);
        let mut be = MockBackend::new(1);
        run(&mut sched, &mut be, 3);
        let waits_and_submits: Vec<_> = be
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Wait(_) | Call::Submit(_)))
            .cloned()
            .collect();
        assert_eq!(
            waits_and_submits,
            vec![
                Call::Wait(0),
                Call::Submit(0),
                Call::Wait(0),
                Call::Submit(0),
                Call::Wait(0),
                Call::Submit(0),
            ]
        );
    }
}
