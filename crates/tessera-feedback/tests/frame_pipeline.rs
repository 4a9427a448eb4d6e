//! Frame pipeline tests driving the feedback manager like a host would

use tessera_core::{FrameClock, TextureId, TileStateKind, TiledTextureDesc};
use tessera_feedback::{
    FeedbackData, FeedbackManager, FeedbackManagerDesc, FeedbackUpdateConfig, FrameEvents, FrameUpdate,
    HeapBackend, TextureTiles,
};

#[derive(Default)]
struct RecordingBackend {
    created: u32,
    destroyed: Vec<u32>,
    refuse: bool,
}

impl HeapBackend for RecordingBackend {
    type Heap = u32;
    type Error = String;

    fn create_heap(&mut self, _size_in_bytes: u64) -> Result<u32, String> {
        if self.refuse {
            return Err("out of memory".into());
        }
        self.created += 1;
        Ok(self.created)
    }

    fn destroy_heap(&mut self, heap: u32) {
        self.destroyed.push(heap);
    }
}

fn manager_with(desc: FeedbackManagerDesc, backend: RecordingBackend) -> FeedbackManager<RecordingBackend> {
    FeedbackManager::with_clock(desc, backend, FrameClock::manual()).unwrap()
}

fn frames_in_flight(n: u32) -> FeedbackManagerDesc {
    FeedbackManagerDesc { num_frames_in_flight: n, ..Default::default() }
}

fn config(frame_index: u64) -> FeedbackUpdateConfig {
    FeedbackUpdateConfig {
        num_extra_standby_tiles: 0,
        ..FeedbackUpdateConfig::default()
    }
    .with_frame_index(frame_index)
}

/// Begin a frame, commit every mapping, and resolve `tiles` for each scheduled texture
fn run_frame(
    manager: &mut FeedbackManager<RecordingBackend>,
    config: &FeedbackUpdateConfig,
    tiles: &[u32],
) -> FrameUpdate {
    manager.clock_mut().advance(1.0);
    let update = manager.begin_frame(config).unwrap();
    manager.update_tile_mappings(&update.tiles_to_map).unwrap();
    for &texture in &update.textures_to_resolve {
        manager
            .resolve_feedback(texture, FeedbackData::Tiles(tiles.to_vec()))
            .unwrap();
    }
    manager.end_frame();
    update
}

fn mapped(update: &FrameUpdate, texture: TextureId) -> Vec<u32> {
    update
        .tiles_to_map
        .iter()
        .find(|entry| entry.texture == texture)
        .map(|entry| entry.tiles.clone())
        .unwrap_or_default()
}

#[test]
fn test_feedback_consumed_after_frames_in_flight() {
    let mut manager = manager_with(frames_in_flight(2), RecordingBackend::default());
    let texture = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
        .unwrap();

    let first = run_frame(&mut manager, &config(0), &[0]);
    assert_eq!(mapped(&first, texture), vec![10]);

    let second = run_frame(&mut manager, &config(1), &[0]);
    assert!(second.tiles_to_map.is_empty());

    let third = run_frame(&mut manager, &config(2), &[0]);
    assert_eq!(mapped(&third, texture), vec![0]);
    assert_eq!(manager.stats().textures_serviced, 1);
    assert_eq!(
        manager.residency().tile_state(texture, 0).unwrap().kind(),
        TileStateKind::Mapped
    );
}

#[test]
fn test_round_robin_feedback() {
    let mut manager = manager_with(frames_in_flight(1), RecordingBackend::default());
    let textures: Vec<_> = (0..3)
        .map(|_| {
            manager
                .create_texture(TiledTextureDesc::with_full_mip_chain(256, 256, 128, 128))
                .unwrap()
        })
        .collect();

    let mut scheduled = Vec::new();
    for frame in 0..4 {
        let config = FeedbackUpdateConfig { max_textures_to_update: 1, ..config(frame) };
        scheduled.extend(run_frame(&mut manager, &config, &[]).textures_to_resolve);
    }
    assert_eq!(scheduled, vec![textures[0], textures[1], textures[2], textures[0]]);
}

#[test]
fn test_followers_stream_with_primary() {
    let mut manager = manager_with(frames_in_flight(1), RecordingBackend::default());
    let primary = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(1024, 1024, 128, 128))
        .unwrap();
    let follower = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(512, 512, 128, 128))
        .unwrap();
    manager.create_texture_set(&[primary, follower]).unwrap();

    let first = run_frame(&mut manager, &config(0), &[0]);
    assert_eq!(first.textures_to_resolve, vec![primary]);

    let second = run_frame(&mut manager, &config(1), &[0]);
    assert_eq!(
        second.tiles_to_map,
        vec![
            TextureTiles { texture: primary, tiles: vec![0] },
            TextureTiles { texture: follower, tiles: vec![0] },
        ]
    );
}

#[test]
fn test_camera_cut_discards_in_flight_feedback() {
    let mut manager = manager_with(frames_in_flight(1), RecordingBackend::default());
    let texture = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
        .unwrap();

    run_frame(&mut manager, &config(0), &[3]);

    let mut cut = config(1);
    cut.events |= FrameEvents::CAMERA_CUT;
    let update = run_frame(&mut manager, &cut, &[3]);
    assert!(update.tiles_to_map.is_empty());
    assert_eq!(update.textures_to_resolve, vec![texture]);
    assert_eq!(manager.stats().textures_serviced, 0);

    let update = run_frame(&mut manager, &config(2), &[]);
    assert_eq!(mapped(&update, texture), vec![3]);
}

#[test]
fn test_empty_heaps_released_after_frames_in_flight() {
    let desc = FeedbackManagerDesc {
        num_frames_in_flight: 2,
        heap_size_in_tiles: 4,
        always_map_packed_tiles: false,
        ..Default::default()
    };
    let mut manager = manager_with(desc, RecordingBackend::default());
    let texture = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(512, 512, 128, 128))
        .unwrap();
    let frame_config = |frame| FeedbackUpdateConfig {
        tile_timeout_seconds: 0.5,
        release_empty_heaps: true,
        ..config(frame)
    };
    let requested = [0, 1, 2, 3, 4, 5];

    run_frame(&mut manager, &frame_config(0), &requested);
    run_frame(&mut manager, &frame_config(1), &requested);
    let update = run_frame(&mut manager, &frame_config(2), &[]);
    assert_eq!(update.heaps_added.len(), 2);
    assert_eq!(mapped(&update, texture), requested.to_vec());

    run_frame(&mut manager, &frame_config(3), &[]);
    run_frame(&mut manager, &frame_config(4), &[]);
    assert_eq!(manager.stats().tiles_standby, 6);

    let update = run_frame(&mut manager, &frame_config(5), &[]);
    assert_eq!(update.tiles_to_unmap, vec![TextureTiles { texture, tiles: requested.to_vec() }]);
    assert!(update.heaps_released.is_empty());

    let update = run_frame(&mut manager, &frame_config(6), &[]);
    assert_eq!(update.heaps_released.len(), 2);
    assert_eq!(manager.heap_allocator().num_pending_release(), 2);
    assert!(manager.heap_allocator().backend().destroyed.is_empty());

    run_frame(&mut manager, &frame_config(7), &[]);
    assert!(manager.heap_allocator().backend().destroyed.is_empty());

    run_frame(&mut manager, &frame_config(8), &[]);
    assert_eq!(manager.heap_allocator().backend().destroyed.len(), 2);
    assert_eq!(manager.stats().heap_allocation_in_bytes, 0);
}

#[test]
fn test_refused_heaps_leave_tiles_requested() {
    let backend = RecordingBackend { refuse: true, ..Default::default() };
    let mut manager = manager_with(frames_in_flight(1), backend);
    let texture = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
        .unwrap();

    let update = run_frame(&mut manager, &config(0), &[]);
    assert!(update.heaps_added.is_empty());
    assert!(update.tiles_to_map.is_empty());

    let stats = manager.stats();
    assert_eq!(stats.heap_allocation_failures, 1);
    assert_eq!(stats.tiles_requested, 1);
    assert_eq!(
        manager.residency().tile_state(texture, 10).unwrap().kind(),
        TileStateKind::Requested
    );
}

#[test]
fn test_removed_texture_drops_out_of_pipeline() {
    let mut manager = manager_with(frames_in_flight(1), RecordingBackend::default());
    let kept = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(256, 256, 128, 128))
        .unwrap();
    let removed = manager
        .create_texture(TiledTextureDesc::with_full_mip_chain(256, 256, 128, 128))
        .unwrap();

    run_frame(&mut manager, &config(0), &[0]);
    manager.remove_texture(removed).unwrap();

    let update = run_frame(&mut manager, &config(1), &[]);
    assert_eq!(update.textures_to_resolve, vec![kept]);
    assert_eq!(mapped(&update, kept), vec![0]);
    assert!(mapped(&update, removed).is_empty());
    assert_eq!(manager.textures().collect::<Vec<_>>(), vec![kept]);
}
