//! Motion tasks: control-word construction and completion polling.
//!
//! A motion task is a stored, device-side move descriptor (position,
//! velocity, accel/decel and a bit-encoded control word) that can be
//! triggered and chained. The control word packs three independent
//! choices into disjoint bit ranges; they are modeled here as one enum
//! per bit-group with an explicit encode/decode pair, so no call site
//! ever does raw flag arithmetic.

use std::time::Duration;

use bitflags::bitflags;
use log::info;
use tokio::time::{sleep, Instant};

use crate::cancel::CancelToken;
use crate::error::{DriveError, DriveResult};
use crate::protocol::DriveSession;

bitflags! {
    /// Device motion status word (`drv.motionstat`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MotionStatus: u32 {
        const MOTION_ACTIVE          = 1 << 0;
        const HOME_FOUND             = 1 << 1;
        const HOME_FINISHED          = 1 << 2;
        const HOMING_ACTIVE          = 1 << 3;
        const HOMING_ERROR           = 1 << 4;
        const SLAVE_GEARING_SYNCED   = 1 << 5;
        const GEARING_ACTIVE         = 1 << 6;
        const ESTOP_ACTIVE           = 1 << 7;
        const ESTOP_ERROR            = 1 << 8;
        const SERVICE_MOTION_ACTIVE  = 1 << 9;
        const TASK_INVALID           = 1 << 10;
        const TASK_COMPLETED         = 1 << 11;
        const TASK_VELOCITY_REACHED  = 1 << 12;
        const TASK_FAULT             = 1 << 13;
        const TASK_POSITION_CROSSED  = 1 << 14;
        const TASK_POSITION_REACHED  = 1 << 15;
        const BASIC_MOVE_IN_PROGRESS = 1 << 16;
        const BASIC_MOVE_COMPLETED   = 1 << 17;
        const NEAR_HOME              = 1 << 21;
        const COGGING_TEACH_MOVE     = 1 << 22;
    }
}

impl MotionStatus {
    /// Status bits that indicate a device-reported failure.
    pub fn is_error(&self) -> bool {
        self.intersects(
            MotionStatus::HOMING_ERROR
                | MotionStatus::ESTOP_ACTIVE
                | MotionStatus::ESTOP_ERROR
                | MotionStatus::TASK_INVALID
                | MotionStatus::TASK_FAULT,
        )
    }
}

/// How the task's target position is interpreted. Bits 0-3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionReference {
    /// Target is the task position itself.
    Absolute,
    /// Target = command position + task position.
    RelativeToCommand,
    /// Target = previous task's target + task position.
    RelativeToPreviousTarget,
    /// Target = external start position + task position.
    RelativeToExternal,
    /// Target = feedback position + task position.
    RelativeToFeedback,
}

impl PositionReference {
    fn bits(self) -> u32 {
        match self {
            PositionReference::Absolute => 0b0000,
            PositionReference::RelativeToCommand => 0b0001,
            PositionReference::RelativeToPreviousTarget => 0b0011,
            PositionReference::RelativeToExternal => 0b0101,
            PositionReference::RelativeToFeedback => 0b0111,
        }
    }

    fn from_bits(bits: u32) -> DriveResult<Self> {
        match bits {
            0b0000 => Ok(PositionReference::Absolute),
            0b0001 => Ok(PositionReference::RelativeToCommand),
            0b0011 => Ok(PositionReference::RelativeToPreviousTarget),
            0b0101 => Ok(PositionReference::RelativeToExternal),
            0b0111 => Ok(PositionReference::RelativeToFeedback),
            other => Err(DriveError::Parameter(format!(
                "unknown position reference bits {:#06b} in control word",
                other
            ))),
        }
    }
}

/// How (and whether) the next task is started after this one. Bit 4 plus
/// bits 5-9.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chaining {
    /// No chaining; the task stands alone.
    None,
    /// Start the next task immediately after stopping.
    Immediate,
    /// Start the next task after stopping plus the dwell time.
    Dwell,
    /// Start the next task after stopping plus an external event.
    ExternalEvent,
    /// Change over at the present task's speed, no stop in between.
    MergeAtSpeed,
    /// Change over already at the next task's speed.
    MergeAtAccel,
}

const EXECUTE_NEXT: u32 = 1 << 4;
const CHAIN_SHIFT: u32 = 5;
const CHAIN_MASK: u32 = 0b11111;

impl Chaining {
    fn bits(self) -> u32 {
        let code = match self {
            Chaining::None => return 0,
            Chaining::Immediate => 0b00000,
            Chaining::Dwell => 0b00001,
            Chaining::ExternalEvent => 0b00010,
            Chaining::MergeAtSpeed => 0b10000,
            Chaining::MergeAtAccel => 0b11000,
        };
        EXECUTE_NEXT | (code << CHAIN_SHIFT)
    }

    fn from_bits(raw: u32) -> DriveResult<Self> {
        let code = (raw >> CHAIN_SHIFT) & CHAIN_MASK;
        if raw & EXECUTE_NEXT == 0 {
            if code != 0 {
                return Err(DriveError::Parameter(format!(
                    "chaining bits {:#07b} set without the execute-next bit",
                    code
                )));
            }
            return Ok(Chaining::None);
        }
        match code {
            0b00000 => Ok(Chaining::Immediate),
            0b00001 => Ok(Chaining::Dwell),
            0b00010 => Ok(Chaining::ExternalEvent),
            0b10000 => Ok(Chaining::MergeAtSpeed),
            0b11000 => Ok(Chaining::MergeAtAccel),
            other => Err(DriveError::Parameter(format!(
                "unknown chaining bits {:#07b} in control word",
                other
            ))),
        }
    }
}

/// Shape of the acceleration profile. Bits 10-11.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelProfile {
    /// Trapezoidal acceleration and deceleration.
    Trapezoidal,
    /// Customer motion profile table, followed 1:1.
    OneToOneTable,
    /// Customer motion profile table with a constant-velocity phase.
    StandardTable,
}

const PROFILE_SHIFT: u32 = 10;
const PROFILE_MASK: u32 = 0b11;

impl AccelProfile {
    fn bits(self) -> u32 {
        let code = match self {
            AccelProfile::Trapezoidal => 0b00,
            AccelProfile::OneToOneTable => 0b01,
            AccelProfile::StandardTable => 0b11,
        };
        code << PROFILE_SHIFT
    }

    fn from_bits(raw: u32) -> DriveResult<Self> {
        match (raw >> PROFILE_SHIFT) & PROFILE_MASK {
            0b00 => Ok(AccelProfile::Trapezoidal),
            0b01 => Ok(AccelProfile::OneToOneTable),
            0b11 => Ok(AccelProfile::StandardTable),
            other => Err(DriveError::Parameter(format!(
                "unknown acceleration profile bits {:#04b} in control word",
                other
            ))),
        }
    }
}

/// The task control word: exactly one value from each bit-group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlWord {
    pub position_ref: PositionReference,
    pub chaining: Chaining,
    pub profile: AccelProfile,
}

impl Default for ControlWord {
    fn default() -> Self {
        Self {
            position_ref: PositionReference::Absolute,
            chaining: Chaining::None,
            profile: AccelProfile::Trapezoidal,
        }
    }
}

impl ControlWord {
    /// Pack into the raw word. The bit-groups occupy disjoint ranges by
    /// construction.
    pub fn encode(&self) -> u32 {
        self.position_ref.bits() | self.chaining.bits() | self.profile.bits()
    }

    /// Unpack a raw word read back from a drive.
    pub fn decode(raw: u32) -> DriveResult<Self> {
        Ok(Self {
            position_ref: PositionReference::from_bits(raw & 0b1111)?,
            chaining: Chaining::from_bits(raw)?,
            profile: AccelProfile::from_bits(raw)?,
        })
    }
}

/// A device-side move descriptor.
#[derive(Clone, Debug)]
pub struct MotionTask {
    /// Task table slot.
    pub index: u32,
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    pub control: ControlWord,
    /// Slot of the task to chain into, when the control word chains.
    pub next: Option<u32>,
    /// Dwell before the next task, for [`Chaining::Dwell`].
    pub dwell_ms: u32,
}

impl MotionTask {
    /// A stand-alone absolute trapezoidal move.
    pub fn new(index: u32, position: f64, velocity: f64, acceleration: f64, deceleration: f64) -> Self {
        Self {
            index,
            position,
            velocity,
            acceleration,
            deceleration,
            control: ControlWord::default(),
            next: None,
            dwell_ms: 0,
        }
    }

    /// Make the move relative to the command position.
    pub fn relative(mut self) -> Self {
        self.control.position_ref = PositionReference::RelativeToCommand;
        self
    }

    /// Chain into `next` immediately, or after `dwell_ms` when nonzero.
    pub fn chain(mut self, next: u32, dwell_ms: u32) -> Self {
        self.next = Some(next);
        self.dwell_ms = dwell_ms;
        self.control.chaining = if dwell_ms > 0 {
            Chaining::Dwell
        } else {
            Chaining::Immediate
        };
        self
    }
}

/// Write a task into the device task table and latch it.
pub async fn setup_task(session: &mut DriveSession, task: &MotionTask) -> DriveResult<()> {
    if task.control.chaining != Chaining::None && task.next.is_none() {
        return Err(DriveError::Parameter(format!(
            "motion task {} chains but names no next task",
            task.index
        )));
    }

    session.set("mt.num", task.index).await?;
    session.set("mt.p", task.position).await?;
    session.set("mt.v", task.velocity).await?;
    session.set("mt.acc", task.acceleration).await?;
    session.set("mt.dec", task.deceleration).await?;

    if let Some(next) = task.next {
        session.set("mt.mtnext", next).await?;
        if task.dwell_ms > 0 {
            session.set("mt.tnext", task.dwell_ms).await?;
        }
    }

    session.set("mt.cntl", task.control.encode()).await?;
    session.command("mt.set").await?;
    Ok(())
}

/// Per-session motion state: the saved operating modes and the last
/// triggered task live here, not in any process-wide table.
#[derive(Default)]
pub struct MotionRunner {
    saved_modes: Option<(i64, i64)>,
    last_task: Option<u32>,
}

impl MotionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot of the most recently triggered task, if any.
    pub fn last_task(&self) -> Option<u32> {
        self.last_task
    }

    /// Put the drive in position service mode, remembering the previous
    /// opmode/cmdsource pair for [`MotionRunner::restore_modes`].
    pub async fn enter_service_mode(&mut self, session: &mut DriveSession) -> DriveResult<()> {
        let opmode = session.command_int("drv.opmode").await?;
        let cmdsource = session.command_int("drv.cmdsource").await?;
        self.saved_modes = Some((opmode, cmdsource));
        session.set("drv.opmode", 2).await?; // position mode
        session.set("drv.cmdsource", 0).await?; // service mode
        Ok(())
    }

    /// Restore the operating modes saved by
    /// [`MotionRunner::enter_service_mode`].
    pub async fn restore_modes(&mut self, session: &mut DriveSession) -> DriveResult<()> {
        if let Some((opmode, cmdsource)) = self.saved_modes.take() {
            session.set("drv.opmode", opmode).await?;
            session.set("drv.cmdsource", cmdsource).await?;
        }
        Ok(())
    }

    /// Wipe the device task table.
    pub async fn clear_tasks(session: &mut DriveSession) -> DriveResult<()> {
        session.set("mt.clear", -1).await?;
        Ok(())
    }

    /// Read the motion status word.
    pub async fn status(session: &mut DriveSession) -> DriveResult<MotionStatus> {
        let raw = session.command_int("drv.motionstat").await?;
        Ok(MotionStatus::from_bits_truncate(raw as u32))
    }

    /// Whether the task has finished. Completion means the completed bit
    /// is set and motion is no longer active. Error bits while incomplete
    /// are a [`DriveError::MotionFault`] — except that a task which
    /// already completed may carry a stale fault bit from a tiny
    /// on-the-fly update, which is not a failure.
    pub fn check_completed(status: MotionStatus) -> DriveResult<bool> {
        let done = status.contains(MotionStatus::TASK_COMPLETED)
            && !status.contains(MotionStatus::MOTION_ACTIVE);
        if !done && status.is_error() {
            return Err(DriveError::MotionFault(format!(
                "motion status {:?}",
                status
            )));
        }
        Ok(done)
    }

    /// Trigger task `index` and poll until completion or fault. The drive
    /// is enabled first; device faults seen while polling are re-raised.
    /// Cancellation stops the drive and returns cleanly.
    pub async fn run(
        &mut self,
        session: &mut DriveSession,
        index: u32,
        cancel: &CancelToken,
    ) -> DriveResult<()> {
        self.enter_service_mode(session).await?;
        session.enable().await?;
        session.set("mt.move", index).await?;
        self.last_task = Some(index);

        let mut last_report = Instant::now();
        loop {
            if cancel.is_cancelled() {
                session.command("drv.stop").await?;
                info!("[{}] motion task {} stopped", session.label(), index);
                return Ok(());
            }

            let status = Self::status(session).await?;
            if Self::check_completed(status)? {
                break;
            }

            let faults = session.faults(true).await?;
            if !faults.is_empty() {
                return Err(DriveError::MotionFault(format!(
                    "drive faults: {}",
                    faults.join(",")
                )));
            }

            if last_report.elapsed() > Duration::from_secs(2) {
                let position = session.command_str("pl.fb").await?;
                info!("[{}] position: {}", session.label(), position.trim());
                last_report = Instant::now();
            }
            sleep(Duration::from_millis(10)).await;
        }

        let position = session.command_str("pl.fb").await?;
        info!(
            "[{}] motion task {} completed at {}",
            session.label(),
            index,
            position.trim()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION_REFS: [PositionReference; 5] = [
        PositionReference::Absolute,
        PositionReference::RelativeToCommand,
        PositionReference::RelativeToPreviousTarget,
        PositionReference::RelativeToExternal,
        PositionReference::RelativeToFeedback,
    ];
    const CHAININGS: [Chaining; 6] = [
        Chaining::None,
        Chaining::Immediate,
        Chaining::Dwell,
        Chaining::ExternalEvent,
        Chaining::MergeAtSpeed,
        Chaining::MergeAtAccel,
    ];
    const PROFILES: [AccelProfile; 3] = [
        AccelProfile::Trapezoidal,
        AccelProfile::OneToOneTable,
        AccelProfile::StandardTable,
    ];

    #[test]
    fn test_control_word_roundtrip_all_combinations() {
        for position_ref in POSITION_REFS {
            for chaining in CHAININGS {
                for profile in PROFILES {
                    let word = ControlWord {
                        position_ref,
                        chaining,
                        profile,
                    };
                    let decoded = ControlWord::decode(word.encode()).unwrap();
                    assert_eq!(decoded, word, "raw {:#x}", word.encode());
                }
            }
        }
    }

    #[test]
    fn test_known_encodings() {
        // Absolute, stand-alone, trapezoidal: all groups at zero.
        assert_eq!(ControlWord::default().encode(), 0);

        // Relative chained with dwell: bit 0, execute-next, dwell code.
        let word = ControlWord {
            position_ref: PositionReference::RelativeToCommand,
            chaining: Chaining::Dwell,
            profile: AccelProfile::Trapezoidal,
        };
        assert_eq!(word.encode(), 0b0001 | 0x10 | (0b00001 << 5));

        // Merge-at-speed sits in the high chain bits.
        let word = ControlWord {
            position_ref: PositionReference::Absolute,
            chaining: Chaining::MergeAtSpeed,
            profile: AccelProfile::Trapezoidal,
        };
        assert_eq!(word.encode(), 0x10 | (0b10000 << 5));

        // Standard profile table is bits 10-11 = 0b11.
        let word = ControlWord {
            position_ref: PositionReference::Absolute,
            chaining: Chaining::None,
            profile: AccelProfile::StandardTable,
        };
        assert_eq!(word.encode(), 0b11 << 10);
    }

    #[test]
    fn test_decode_rejects_reserved_patterns() {
        // Reserved position-reference pattern.
        assert!(ControlWord::decode(0b1000).is_err());
        // Chain code without the execute-next bit.
        assert!(ControlWord::decode(0b00001 << 5).is_err());
        // Reserved acceleration profile 0b10.
        assert!(ControlWord::decode(0b10 << 10).is_err());
    }

    #[test]
    fn test_motion_status_is_error() {
        for bad in [
            MotionStatus::HOMING_ERROR,
            MotionStatus::ESTOP_ACTIVE,
            MotionStatus::ESTOP_ERROR,
            MotionStatus::TASK_INVALID,
            MotionStatus::TASK_FAULT,
        ] {
            assert!(bad.is_error());
        }
        let benign = MotionStatus::MOTION_ACTIVE
            | MotionStatus::TASK_COMPLETED
            | MotionStatus::TASK_VELOCITY_REACHED
            | MotionStatus::HOME_FOUND;
        assert!(!benign.is_error());
    }

    #[test]
    fn test_completion_check() {
        let done = MotionStatus::TASK_COMPLETED;
        assert!(MotionRunner::check_completed(done).unwrap());

        let still_moving = MotionStatus::TASK_COMPLETED | MotionStatus::MOTION_ACTIVE;
        assert!(!MotionRunner::check_completed(still_moving).unwrap());

        let faulted = MotionStatus::TASK_FAULT;
        assert!(MotionRunner::check_completed(faulted).is_err());

        // A completed task may carry a stale fault bit; not a failure.
        let stale = MotionStatus::TASK_COMPLETED | MotionStatus::TASK_FAULT;
        assert!(MotionRunner::check_completed(stale).unwrap());
    }

    #[test]
    fn test_task_builder_chain() {
        let task = MotionTask::new(0, 90.0, 10.0, 100.0, 100.0).chain(1, 250);
        assert_eq!(task.control.chaining, Chaining::Dwell);
        assert_eq!(task.next, Some(1));

        let task = MotionTask::new(0, 90.0, 10.0, 100.0, 100.0).chain(1, 0);
        assert_eq!(task.control.chaining, Chaining::Immediate);
    }
}
