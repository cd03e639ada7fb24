//! Stream-level tests for the TETH01 codec
//!
//! Feeds a realistic negotiation sequence through a single byte buffer, the
//! way a socket reader sees it, in both body encodings.

use bytes::BytesMut;
use pretty_assertions::assert_eq;
use tetherproto::{
    AckedEvent, BufferDesc, BufferLayout, ClientMethod, ContentType, DataDesc, Direction,
    FormatFlags, FrameKind, MemId, NodeChange, NodeFrame, Pod, PortChange, PortId, PortInfo,
    ServerEvent, Seq, DEFAULT_MAX_BODY,
};

fn negotiation() -> Vec<ServerEvent> {
    let format = Pod::new(0x40003, &b"S16LE/48000/2"[..]);
    vec![
        ServerEvent::acked(
            Seq(1),
            AckedEvent::AddPort {
                direction: Direction::Output,
                port_id: PortId(0),
            },
        ),
        ServerEvent::acked(
            Seq(2),
            AckedEvent::SetFormat {
                direction: Direction::Output,
                port_id: PortId(0),
                flags: FormatFlags::empty(),
                format: Some(format),
            },
        ),
        ServerEvent::acked(
            Seq(3),
            AckedEvent::UseBuffers {
                direction: Direction::Output,
                port_id: PortId(0),
                buffers: vec![BufferDesc {
                    mem_id: MemId(7),
                    offset: 0,
                    size: 64,
                    layout: BufferLayout {
                        id: 0,
                        metas: vec![],
                        datas: vec![DataDesc {
                            mem_id: MemId(7),
                            offset: 64,
                            size: 4032,
                        }],
                    },
                }],
            },
        ),
    ]
}

fn pump(content_type: ContentType) {
    let events = negotiation();
    let mut stream = BytesMut::new();
    for ev in &events {
        NodeFrame::event(ev, content_type).unwrap().encode(&mut stream);
    }

    let mut decoded = Vec::new();
    while let Some(frame) = NodeFrame::decode(&mut stream, DEFAULT_MAX_BODY).unwrap() {
        assert_eq!(frame.kind, FrameKind::Event);
        assert_eq!(frame.content_type, content_type);
        decoded.push(frame.to_event().unwrap());
    }

    assert!(stream.is_empty());
    assert_eq!(decoded, events);
}

#[test]
fn negotiation_over_msgpack() {
    pump(ContentType::MsgPack);
}

#[test]
fn negotiation_over_json() {
    pump(ContentType::Json);
}

#[test]
fn client_updates_survive_the_stream() {
    let methods = vec![
        ClientMethod::Update {
            change_mask: NodeChange::MAX_INPUTS | NodeChange::MAX_OUTPUTS,
            max_input_ports: 0,
            max_output_ports: 1,
            props: None,
        },
        ClientMethod::PortUpdate {
            direction: Direction::Output,
            port_id: PortId(0),
            change_mask: PortChange::POSSIBLE_FORMATS | PortChange::INFO,
            possible_formats: vec![Pod::new(0x40003, &b"S16LE/48000/2"[..])],
            format: None,
            params: vec![],
            info: Some(PortInfo::default()),
        },
        ClientMethod::Done {
            seq: Seq(1),
            res: 0,
        },
    ];

    let mut stream = BytesMut::new();
    for m in &methods {
        NodeFrame::method(m, ContentType::MsgPack)
            .unwrap()
            .encode(&mut stream);
    }

    // One byte at a time, as a slow socket might deliver it.
    let raw = stream.split().freeze();
    let mut rx = BytesMut::new();
    let mut decoded = Vec::new();
    for b in raw.iter() {
        rx.extend_from_slice(&[*b]);
        if let Some(frame) = NodeFrame::decode(&mut rx, DEFAULT_MAX_BODY).unwrap() {
            decoded.push(frame.to_method().unwrap());
        }
    }
    assert_eq!(decoded, methods);
}
