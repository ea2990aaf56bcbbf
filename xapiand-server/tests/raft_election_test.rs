//! Election scenarios on an in-process bus with multicast semantics:
//! every message reaches every node in the region, the sender
//! included (a candidate's own vote arrives through loopback).

use std::collections::VecDeque;

use xapiand_server::node::Node;
use xapiand_server::raft::{RaftAction, RaftEvent, RaftMessage, RaftRole, RaftState};

struct Region {
    states: Vec<RaftState>,
    bus: VecDeque<RaftMessage>,
}

impl Region {
    fn new(count: usize, region: i32) -> Self {
        let states = (0..count)
            .map(|index| {
                let mut node = Node::new(format!("node-{index}"), format!("10.1.0.{index}"));
                node.region = region;
                let mut state = RaftState::new(node);
                state.set_number_servers(count);
                state
            })
            .collect();
        Self {
            states,
            bus: VecDeque::new(),
        }
    }

    fn collect(&mut self, actions: Vec<RaftAction>) {
        for action in actions {
            if let RaftAction::Send(message) = action {
                self.bus.push_back(message);
            }
        }
    }

    fn timeout(&mut self, index: usize) {
        let actions = self.states[index].advance(RaftEvent::ElectionTimeout);
        self.collect(actions);
    }

    fn pump(&mut self) {
        while let Some(message) = self.bus.pop_front() {
            for index in 0..self.states.len() {
                let actions = self.states[index].advance(RaftEvent::Packet(message.clone()));
                self.collect(actions);
            }
        }
    }

    fn leaders(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.role() == RaftRole::Leader)
            .map(|(index, _)| index)
            .collect()
    }
}

#[test]
fn five_followers_elect_exactly_one_leader() {
    let mut region = Region::new(5, 0);
    region.timeout(0);
    region.pump();

    assert_eq!(region.leaders(), vec![0]);
    let term = region.states[0].term();
    for (index, state) in region.states.iter().enumerate() {
        if index != 0 {
            assert_eq!(state.role(), RaftRole::Follower);
        }
        assert_eq!(state.term(), term, "node {index} disagrees on the term");
    }
}

#[test]
fn split_candidates_never_yield_two_leaders_in_a_term() {
    let mut region = Region::new(5, 0);
    // Two nodes time out before any message is delivered.
    region.timeout(0);
    region.timeout(1);
    region.pump();

    let leaders = region.leaders();
    assert!(leaders.len() <= 1, "split vote produced {leaders:?}");
    // Whoever won, no two nodes ever observed themselves leader in the
    // same term: re-run the losing side's timeout and check terms
    // stay disjoint.
    if let Some(&winner) = leaders.first() {
        let winner_term = region.states[winner].term();
        for (index, state) in region.states.iter().enumerate() {
            if index != winner && state.role() == RaftRole::Leader {
                assert_ne!(state.term(), winner_term);
            }
        }
    }
}

#[test]
fn leader_heartbeats_keep_followers_reset() {
    let mut region = Region::new(3, 0);
    region.timeout(2);
    region.pump();
    assert_eq!(region.leaders(), vec![2]);

    // The leader ticks; followers reset their election timers and ask
    // for the configuration of the new leader.
    let actions = region.states[2].advance(RaftEvent::HeartbeatTick);
    region.collect(actions);
    region.pump();

    for index in [0, 1] {
        assert_eq!(region.states[index].role(), RaftRole::Follower);
        assert_eq!(
            region.states[index].leader().map(|node| node.name.clone()),
            Some("node-2".to_owned())
        );
    }
}

#[test]
fn failed_leader_is_replaced_next_term() {
    let mut region = Region::new(5, 0);
    region.timeout(0);
    region.pump();
    assert_eq!(region.leaders(), vec![0]);
    let first_term = region.states[0].term();

    // Node 0 goes dark: its messages stop flowing. Node 3 times out
    // and takes over with a higher term.
    region.timeout(3);
    // Drop the dead leader from delivery by pumping to the others
    // manually.
    while let Some(message) = region.bus.pop_front() {
        for index in 1..region.states.len() {
            let actions = region.states[index].advance(RaftEvent::Packet(message.clone()));
            region.collect(actions);
        }
    }

    assert_eq!(region.states[3].role(), RaftRole::Leader);
    assert!(region.states[3].term() > first_term);
}

#[test]
fn regions_elect_independently() {
    let mut east = Region::new(3, 0);
    let mut west = Region::new(3, 1);
    east.timeout(0);
    east.pump();
    west.timeout(1);
    west.pump();

    assert_eq!(east.leaders(), vec![0]);
    assert_eq!(west.leaders(), vec![1]);

    // Cross-region traffic is ignored outright.
    let foreign = east.states[0].local_node().clone();
    let actions = west.states[0].advance(RaftEvent::Packet(RaftMessage::RequestVote {
        node: foreign,
        term: 99,
    }));
    assert!(actions.is_empty());
    assert!(west.states[0].term() < 99);
}
