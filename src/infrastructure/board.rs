//! Expansion Board Detection
//!
//! Classifies the daughterboard as EXG or IMU after connect. Detection is
//! advisory: every failure ends in an `Unknown` result and never aborts the
//! session.

use crate::domain::models::BoardDetectionResult;
use crate::infrastructure::driver::{
    BoardIdentity, ExpansionBoard, FirmwareDriver, Inspect, Member,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Maximum field depth searched for a board-id getter
pub const MAX_SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct ProbeTimings {
    /// Wait after refresh on the direct path
    pub settle: Duration,
    pub poll_interval: Duration,
    pub first_window: Duration,
    /// Polling after the second refresh
    pub second_window: Duration,
}

impl Default for ProbeTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            first_window: Duration::from_millis(2600),
            second_window: Duration::from_millis(1400),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpansionBoardProbe {
    timings: ProbeTimings,
}

impl ExpansionBoardProbe {
    pub fn new(timings: ProbeTimings) -> Self {
        Self { timings }
    }

    /// Detect through whichever interface the driver offers.
    pub fn detect(&self, driver: &mut dyn FirmwareDriver) -> BoardDetectionResult {
        let result = if let Some(board) = driver.expansion_board() {
            self.detect_direct(board)
        } else if let Some(root) = driver.inspect_root() {
            self.detect_structural(root)
        } else {
            debug!("Driver exposes no expansion board interface");
            BoardDetectionResult::unknown()
        };

        info!("Expansion board: {:?} ({:?})", result.kind, result.raw_id);
        result
    }

    /// Refresh, settle, read once.
    pub fn detect_direct(&self, board: &mut dyn ExpansionBoard) -> BoardDetectionResult {
        if let Err(e) = board.refresh() {
            debug!("Board refresh failed: {}", e);
            return BoardDetectionResult::unknown();
        }
        thread::sleep(self.timings.settle);

        match board.board_id() {
            Ok(id) => BoardDetectionResult::classify(&id),
            Err(e) => {
                debug!("Board id read failed: {}", e);
                BoardDetectionResult::unknown()
            }
        }
    }

    /// Search the driver's object graph for a board-id getter and poll it.
    pub fn detect_structural(&self, root: Arc<dyn Inspect>) -> BoardDetectionResult {
        let owner = match find_board_identity(root, MAX_SEARCH_DEPTH) {
            Some(owner) => owner,
            None => {
                debug!("No board identity getter within depth {}", MAX_SEARCH_DEPTH);
                return BoardDetectionResult::unknown();
            }
        };
        let identity = match owner.board_identity() {
            Some(identity) => identity,
            None => return BoardDetectionResult::unknown(),
        };
        debug!("Board identity found on {}", owner.type_name());

        self.refresh(identity);
        let id = self
            .poll(identity, self.timings.first_window)
            .or_else(|| {
                debug!("Board id still empty; refreshing once more");
                self.refresh(identity);
                self.poll(identity, self.timings.second_window)
            });

        match id {
            Some(id) => BoardDetectionResult::classify(&id),
            None => BoardDetectionResult::unknown(),
        }
    }

    fn refresh(&self, identity: &dyn BoardIdentity) {
        if let Err(e) = identity.request_refresh() {
            debug!("Board refresh failed: {}", e);
        }
    }

    fn poll(&self, identity: &dyn BoardIdentity, window: Duration) -> Option<String> {
        let deadline = Instant::now() + window;
        loop {
            match identity.read_board_id() {
                Ok(id) if !id.trim().is_empty() => return Some(id),
                Ok(_) => {}
                Err(e) => trace!("Board id read failed: {}", e),
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(self.timings.poll_interval);
        }
    }
}

/// Breadth-first search from `root` for an object with a board-id getter.
///
/// Leaves (primitives, enums, strings) are skipped and every object is
/// visited once, by pointer identity, so cyclic graphs terminate.
pub fn find_board_identity(root: Arc<dyn Inspect>, max_depth: usize) -> Option<Arc<dyn Inspect>> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(identity_key(&root));
    queue.push_back((root, 0usize));

    while let Some((node, depth)) = queue.pop_front() {
        if node.board_identity().is_some() {
            return Some(node);
        }
        if depth >= max_depth {
            continue;
        }
        for (name, member) in node.members() {
            if let Member::Object(child) = member {
                if visited.insert(identity_key(&child)) {
                    trace!("Inspecting {}.{}", node.type_name(), name);
                    queue.push_back((child, depth + 1));
                }
            }
        }
    }
    None
}

fn identity_key(node: &Arc<dyn Inspect>) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BoardKind;
    use crate::error::{Error, Result};
    use crate::infrastructure::driver::tests::{FakeBoard, FakeDriver};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> ExpansionBoardProbe {
        ExpansionBoardProbe::new(ProbeTimings {
            settle: Duration::from_millis(1),
            poll_interval: Duration::from_millis(2),
            first_window: Duration::from_millis(30),
            second_window: Duration::from_millis(20),
        })
    }

    /// Object graph node. `id` is served after `ready_after_refreshes`
    /// refresh calls.
    struct Node {
        name: &'static str,
        children: Mutex<Vec<(String, Member)>>,
        id: Option<String>,
        ready_after_refreshes: usize,
        refreshes: AtomicUsize,
        reads: AtomicUsize,
    }

    impl Node {
        fn new(name: &'static str) -> Arc<Self> {
            Self::build(name, None, 0)
        }

        fn with_id(name: &'static str, id: &str, ready_after_refreshes: usize) -> Arc<Self> {
            Self::build(name, Some(id.to_string()), ready_after_refreshes)
        }

        fn build(
            name: &'static str,
            id: Option<String>,
            ready_after_refreshes: usize,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                children: Mutex::new(Vec::new()),
                id,
                ready_after_refreshes,
                refreshes: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
            })
        }

        fn link(&self, name: &str, child: Arc<dyn Inspect>) {
            self.children
                .lock()
                .push((name.to_string(), Member::Object(child)));
        }
    }

    impl Inspect for Node {
        fn type_name(&self) -> &str {
            self.name
        }

        fn members(&self) -> Vec<(String, Member)> {
            let mut members = vec![
                ("Count".to_string(), Member::Primitive),
                ("Label".to_string(), Member::Text(self.name.to_string())),
                ("Mode".to_string(), Member::Enum("Idle".to_string())),
            ];
            for (name, member) in self.children.lock().iter() {
                if let Member::Object(child) = member {
                    members.push((name.clone(), Member::Object(child.clone())));
                }
            }
            members
        }

        fn board_identity(&self) -> Option<&dyn BoardIdentity> {
            self.id.as_ref().map(|_| self as &dyn BoardIdentity)
        }
    }

    impl BoardIdentity for Node {
        fn read_board_id(&self) -> Result<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.refreshes.load(Ordering::SeqCst) >= self.ready_after_refreshes {
                Ok(self.id.clone().unwrap_or_default())
            } else {
                Ok(String::new())
            }
        }

        fn request_refresh(&self) -> Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_direct_path_classifies() {
        let mut driver = FakeDriver {
            board: Some(FakeBoard {
                id: "SHIMMER_EXG_UNIFIED".into(),
                refreshed: 0,
            }),
            ..Default::default()
        };
        let result = fast().detect(&mut driver);
        assert_eq!(result.kind, BoardKind::Exg);
        assert!(result.ok());
        assert_eq!(driver.board.unwrap().refreshed, 1);
    }

    #[test]
    fn test_direct_path_empty_id_is_unknown() {
        let mut board = FakeBoard {
            id: "  ".into(),
            refreshed: 0,
        };
        let result = fast().detect_direct(&mut board);
        assert_eq!(result.kind, BoardKind::Unknown);
        assert!(!result.ok());
    }

    #[test]
    fn test_no_interface_is_unknown() {
        let mut driver = FakeDriver::default();
        assert_eq!(fast().detect(&mut driver).kind, BoardKind::Unknown);
    }

    #[test]
    fn test_structural_search_finds_nested_getter() {
        let root = Node::new("ShimmerDevice");
        let comms = Node::new("Comms");
        let board = Node::with_id("ExpansionBoardInfo", "IMU_BRD_V2", 1);
        comms.link("Board", board.clone());
        root.link("Comms", comms);

        let result = fast().detect_structural(root);
        assert_eq!(result.kind, BoardKind::Imu);
        assert_eq!(result.raw_id.as_deref(), Some("IMU_BRD_V2"));
        assert_eq!(board.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_refresh_recovers_late_board() {
        let root = Node::new("ShimmerDevice");
        let board = Node::with_id("ExpansionBoardInfo", "SHIMMER_EXG_UNIFIED", 2);
        root.link("Board", board.clone());

        let result = fast().detect_structural(root);
        assert_eq!(result.kind, BoardKind::Exg);
        assert_eq!(board.refreshes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_silent_getter_times_out_unknown() {
        let root = Node::new("ShimmerDevice");
        let board = Node::with_id("ExpansionBoardInfo", "IMU_BRD_V2", 99);
        root.link("Board", board.clone());

        let result = fast().detect_structural(root);
        assert_eq!(result.kind, BoardKind::Unknown);
        assert!(board.reads.load(Ordering::SeqCst) > 2);
    }

    #[test]
    fn test_search_is_depth_bounded() {
        // root -> a -> b -> c -> board (depth 4)
        let root = Node::new("Root");
        let a = Node::new("A");
        let b = Node::new("B");
        let c = Node::new("C");
        c.link("Board", Node::with_id("Board", "IMU", 0));
        b.link("C", c);
        a.link("B", b);
        root.link("A", a);

        assert!(find_board_identity(root, MAX_SEARCH_DEPTH).is_none());
    }

    #[test]
    fn test_search_reaches_max_depth() {
        // root -> a -> b -> board (depth 3)
        let root = Node::new("Root");
        let a = Node::new("A");
        let b = Node::new("B");
        b.link("Board", Node::with_id("ExpansionBoardInfo", "IMU_BRD_V2", 0));
        a.link("B", b);
        root.link("A", a);

        let found = find_board_identity(root.clone(), MAX_SEARCH_DEPTH).unwrap();
        assert_eq!(found.type_name(), "ExpansionBoardInfo");
        assert_eq!(fast().detect_structural(root).kind, BoardKind::Imu);
    }

    #[test]
    fn test_search_survives_cycles() {
        let root = Node::new("Root");
        let child = Node::new("Child");
        child.link("Parent", root.clone());
        child.link("Self", child.clone());
        root.link("Child", child.clone());

        assert!(find_board_identity(root.clone(), MAX_SEARCH_DEPTH).is_none());

        // Break the cycles so the test doesn't leak
        child.children.lock().clear();
    }

    #[test]
    fn test_failing_getter_is_unknown() {
        struct Broken;

        impl Inspect for Broken {
            fn type_name(&self) -> &str {
                "Broken"
            }

            fn members(&self) -> Vec<(String, Member)> {
                Vec::new()
            }

            fn board_identity(&self) -> Option<&dyn BoardIdentity> {
                Some(self)
            }
        }

        impl BoardIdentity for Broken {
            fn read_board_id(&self) -> Result<String> {
                Err(Error::Driver("device not responding".into()))
            }
        }

        let result = fast().detect_structural(Arc::new(Broken));
        assert_eq!(result.kind, BoardKind::Unknown);
    }
}
